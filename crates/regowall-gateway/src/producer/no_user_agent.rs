//! Blocks clients that repeatedly hit front-end hosts without a user agent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;

use regowall_core::reputation::canonicalize;
use regowall_core::{PolicyEvent, RateLimiter, RegowallError, Result};

use super::{parse_event_time, IngressEvent, PolicyProducer};
use crate::config::ProducerSection;

pub const POLICY_NAME: &str = "nouseragent";
pub const BLACKLIST_BUCKET: &str = "blacklist";

const RULES: &str = r#"
deny if {
	some prefix in data.nouseragent.host_prefixes
	startswith(input.host, prefix)
	ip_in_bucket("nouseragent", "blacklist", input.ip)
}
"#;

pub struct NoUserAgentProducer {
    limiter: RateLimiter,
    block_duration: chrono::Duration,
    host_prefixes: Vec<String>,
    /// ip -> block expiry; a blocked ip is not re-emitted until it expires.
    blocks: DashMap<String, DateTime<Utc>>,
    /// Latest event time seen, in unix nanos; `i64::MIN` until the first event.
    latest_event_ns: AtomicI64,
}

impl NoUserAgentProducer {
    pub fn new(limiter: RateLimiter, block_duration: Duration, host_prefixes: Vec<String>) -> Result<Self> {
        let block_duration = chrono::Duration::from_std(block_duration)
            .map_err(|e| RegowallError::Config(format!("block duration out of range: {e}")))?;
        Ok(Self {
            limiter,
            block_duration,
            host_prefixes,
            blocks: DashMap::new(),
            latest_event_ns: AtomicI64::new(i64::MIN),
        })
    }

    pub fn from_config(cfg: &ProducerSection) -> Result<Self> {
        Self::new(
            RateLimiter::new(cfg.rate_per_sec, cfg.burst),
            Duration::from_secs(cfg.block_duration_secs),
            cfg.host_prefixes.clone(),
        )
    }

    /// Currently blocked addresses and their expiry.
    pub fn active_blocks(&self, now: DateTime<Utc>) -> BTreeMap<String, DateTime<Utc>> {
        self.blocks
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Newest event time processed so far; the limiter's clock.
    pub fn latest_event_time(&self) -> Option<DateTime<Utc>> {
        match self.latest_event_ns.load(Ordering::Relaxed) {
            i64::MIN => None,
            nanos => Some(DateTime::from_timestamp_nanos(nanos)),
        }
    }

    fn observe(&self, event_time: DateTime<Utc>) {
        if let Some(nanos) = event_time.timestamp_nanos_opt() {
            self.latest_event_ns.fetch_max(nanos, Ordering::Relaxed);
        }
    }
}

fn has_user_agent(event: &IngressEvent) -> bool {
    !event.user_agent.trim().is_empty()
        || event
            .headers
            .iter()
            .any(|(name, values)| {
                name.eq_ignore_ascii_case("user-agent") && values.iter().any(|v| !v.trim().is_empty())
            })
}

impl PolicyProducer for NoUserAgentProducer {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    fn is_relevant(&self, event: &IngressEvent) -> Result<bool> {
        let host_matches = self
            .host_prefixes
            .iter()
            .any(|prefix| event.host.starts_with(prefix.as_str()));
        Ok(host_matches && !has_user_agent(event))
    }

    fn process(&self, event: &IngressEvent, now: DateTime<Utc>) -> Result<Option<PolicyEvent>> {
        let event_time = parse_event_time(&event.time)?;
        if now > event_time + self.block_duration {
            tracing::debug!(%event_time, "event too old to be processed");
            return Ok(None);
        }

        let (_, ip) = canonicalize(&event.ip)?;
        self.observe(event_time);
        if self.limiter.is_allowed(&ip, event_time) {
            return Ok(None);
        }

        let expires_at = now + self.block_duration;
        match self.blocks.entry(ip.clone()) {
            Entry::Occupied(entry) if *entry.get() > now => return Ok(None),
            Entry::Occupied(mut entry) => {
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        tracing::info!(ip = %ip, host = %event.host, %expires_at, "rate limit exceeded without user agent, blocking");

        Ok(Some(
            PolicyEvent::patch(POLICY_NAME).with_bucket_entry(BLACKLIST_BUCKET, ip, expires_at),
        ))
    }

    fn full_event(&self, now: DateTime<Utc>) -> Result<PolicyEvent> {
        let mut event = PolicyEvent::full(POLICY_NAME, RULES.trim_start())
            .with_data(json!({ "host_prefixes": self.host_prefixes }));
        for (ip, expires_at) in self.active_blocks(now) {
            event = event.with_bucket_entry(BLACKLIST_BUCKET, ip, expires_at);
        }
        Ok(event)
    }

    /// Block expiry runs on `now`; the limiter runs on event time, so its
    /// buckets are only evicted against the newest event seen.
    fn housekeeping(&self, now: DateTime<Utc>) {
        self.blocks.retain(|_, expiry| *expiry > now);
        let Some(event_now) = self.latest_event_time() else {
            return;
        };
        let evicted = self.limiter.evict_refilled(event_now);
        if evicted > 0 {
            tracing::debug!(evicted, %event_now, "idle rate limit buckets dropped");
        }
    }
}
