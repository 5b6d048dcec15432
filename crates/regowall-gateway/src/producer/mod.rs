//! Policy producers: turn access-log events into policy events.
//!
//! A [`PolicyController`] fans every ingress event out to its producers,
//! validates what they return and publishes it. It also republishes each
//! producer's FULL event periodically so new consumers converge.

pub mod no_user_agent;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;

use regowall_core::{EventType, PolicyEvent, RegowallError, Result};

use crate::channel::{DeliveryReport, DistributionChannel};
use crate::obs::metrics::FirewallMetrics;

pub use no_user_agent::NoUserAgentProducer;

/// One access-log record (NDJSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressEvent {
    pub host: String,
    pub path: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub ip: String,
    /// Unix seconds with a decimal fraction, e.g. `1583503992.449`.
    pub time: String,
    pub status: String,
    #[serde(rename = "user-agent")]
    pub user_agent: String,
    #[serde(rename = "encrypted-ip")]
    pub encrypted_ip: String,
}

/// `"1583503992.449"` -> 2020-03-06T14:13:12.449Z.
pub fn parse_event_time(raw: &str) -> Result<DateTime<Utc>> {
    let malformed = || {
        RegowallError::Validation(format!(
            "wrong time format {raw:?}, expected something like 1583503992.449"
        ))
    };

    let (secs, fraction) = raw.trim().split_once('.').ok_or_else(malformed)?;
    if secs.is_empty()
        || fraction.is_empty()
        || fraction.len() > 9
        || !secs.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }

    let secs: i64 = secs.parse().map_err(|_| malformed())?;
    let nanos: u32 = format!("{fraction:0<9}").parse().map_err(|_| malformed())?;
    Utc.timestamp_opt(secs, nanos).single().ok_or_else(malformed)
}

pub trait PolicyProducer: Send + Sync {
    fn name(&self) -> &str;

    fn is_relevant(&self, event: &IngressEvent) -> Result<bool>;

    /// A policy event to publish for this ingress event, if any.
    fn process(&self, event: &IngressEvent, now: DateTime<Utc>) -> Result<Option<PolicyEvent>>;

    /// Complete current state of the producer's policy.
    fn full_event(&self, now: DateTime<Utc>) -> Result<PolicyEvent>;

    /// Periodic cleanup of internal state.
    fn housekeeping(&self, _now: DateTime<Utc>) {}
}

pub struct PolicyController {
    producers: Vec<Arc<dyn PolicyProducer>>,
    channel: Arc<dyn DistributionChannel>,
    topic: String,
    metrics: Arc<FirewallMetrics>,
}

impl PolicyController {
    pub fn new(
        producers: Vec<Arc<dyn PolicyProducer>>,
        channel: Arc<dyn DistributionChannel>,
        topic: impl Into<String>,
        metrics: Arc<FirewallMetrics>,
    ) -> Self {
        Self {
            producers,
            channel,
            topic: topic.into(),
            metrics,
        }
    }

    /// Run `event` through every relevant producer. Producer errors are
    /// logged and never stop the others.
    pub fn evaluate(&self, event: &IngressEvent, now: DateTime<Utc>) -> Vec<PolicyEvent> {
        let mut out = Vec::new();
        for producer in &self.producers {
            match producer.is_relevant(event) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(producer = producer.name(), error = %e, "relevance check failed");
                    continue;
                }
            }
            match producer.process(event, now) {
                Ok(Some(policy_event)) => out.push(policy_event),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(producer = producer.name(), ip = %event.ip, error = %e, "producer failed");
                }
            }
        }
        out
    }

    /// Validate and publish one event.
    pub async fn send(&self, event: &PolicyEvent) -> Result<DeliveryReport> {
        event.validate()?;
        let outcome = self.channel.publish(&self.topic, event).await;
        let label = if outcome.is_ok() { "published" } else { "failed" };
        self.metrics
            .producer_events
            .inc(&[("producer", event.name.as_str()), ("outcome", label)]);
        if let Ok(report) = &outcome {
            tracing::info!(
                policy = %event.name,
                kind = event.kind.as_str(),
                partition = report.partition,
                offset = report.offset,
                "policy event sent"
            );
        }
        outcome
    }

    /// Publish every producer's FULL event. Returns how many went out.
    pub async fn sync_policies(&self, now: DateTime<Utc>) -> usize {
        let mut sent = 0;
        for producer in &self.producers {
            let event = match producer.full_event(now) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(producer = producer.name(), error = %e, "full event unavailable");
                    continue;
                }
            };
            if event.kind != EventType::Full {
                tracing::error!(producer = producer.name(), kind = event.kind.as_str(), "expected FULL event type");
                continue;
            }
            if event.rule_source.trim().is_empty() {
                tracing::error!(producer = producer.name(), "rego policy not found");
                continue;
            }
            match self.send(&event).await {
                Ok(_) => sent += 1,
                Err(e) => tracing::error!(producer = producer.name(), error = %e, "full event not sent"),
            }
        }
        sent
    }

    /// Drain an NDJSON stream of ingress events. Unparsable lines are
    /// skipped. Returns how many policy events were published.
    pub async fn ingest<R>(&self, reader: R) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut published = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| RegowallError::Internal(format!("read ingress log: {e}")))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: IngressEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "could not parse ingress event");
                    continue;
                }
            };
            for policy_event in self.evaluate(&event, Utc::now()) {
                match self.send(&policy_event).await {
                    Ok(_) => published += 1,
                    Err(e) => tracing::error!(policy = %policy_event.name, error = %e, "policy event not sent"),
                }
            }
        }
        Ok(published)
    }

    /// Periodic FULL sync until shutdown.
    pub async fn run_sync_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            for producer in &self.producers {
                producer.housekeeping(now);
            }
            self.sync_policies(now).await;
        }
        tracing::info!("policy sync loop stopped");
    }
}
