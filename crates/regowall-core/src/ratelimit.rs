//! Per-key token-bucket limiter driven by event time.
//!
//! Producers replay access logs, so "now" is the time the event happened, not
//! the time it is processed. Each key gets its own bucket on first use; all
//! buckets share one refill interval and burst.
//!
//! Credit is kept in whole nanoseconds: one token costs one interval, and a
//! bucket holds at most `burst` intervals. Waiting exactly one interval
//! therefore always buys exactly one token.
//!
//! Concurrency: buckets live in a sharded `DashMap` and each sits behind its
//! own mutex, so different keys proceed in parallel and calls for the same
//! key are serialized. The shard guard is released before the bucket lock is
//! taken.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug)]
struct TokenBucket {
    credit_ns: u128,
    last: Option<DateTime<Utc>>,
}

impl TokenBucket {
    fn new(capacity_ns: u128) -> Self {
        Self {
            credit_ns: capacity_ns,
            last: None,
        }
    }

    /// Credit the bucket would hold at `now`, without touching it.
    fn projected(&self, now: DateTime<Utc>, capacity_ns: u128) -> u128 {
        match self.last {
            Some(last) if now > last => {
                let elapsed = (now - last).num_nanoseconds().unwrap_or(i64::MAX).max(0);
                self.credit_ns
                    .saturating_add(elapsed as u128)
                    .min(capacity_ns)
            }
            _ => self.credit_ns,
        }
    }

    /// Events older than the last observation do not refill and do not move
    /// the clock back.
    fn refill(&mut self, now: DateTime<Utc>, capacity_ns: u128) {
        self.credit_ns = self.projected(now, capacity_ns);
        if self.last.map_or(true, |last| now > last) {
            self.last = Some(now);
        }
    }

    fn try_take(&mut self, now: DateTime<Utc>, interval_ns: u64, capacity_ns: u128) -> bool {
        self.refill(now, capacity_ns);
        let cost = u128::from(interval_ns);
        if self.credit_ns >= cost {
            self.credit_ns -= cost;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    interval_ns: u64,
    burst: u32,
}

impl RateLimiter {
    /// `rate_per_sec` tokens are added per second, up to `burst` (min 1).
    /// A rate of zero never refills.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let interval_ns = if rate_per_sec.is_finite() && rate_per_sec > 0.0 {
            // float-to-int `as` saturates
            ((NANOS_PER_SEC / rate_per_sec).round() as u64).max(1)
        } else {
            u64::MAX
        };
        Self::with_interval_ns(interval_ns, burst)
    }

    /// One token every `interval`.
    pub fn every(interval: Duration, burst: u32) -> Self {
        let interval_ns = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        Self::with_interval_ns(interval_ns.max(1), burst)
    }

    fn with_interval_ns(interval_ns: u64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            interval_ns,
            burst: burst.max(1),
        }
    }

    pub fn rate_per_sec(&self) -> f64 {
        if self.interval_ns == u64::MAX {
            0.0
        } else {
            NANOS_PER_SEC / self.interval_ns as f64
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns)
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take one token from `key`'s bucket at `event_time`.
    pub fn is_allowed(&self, key: &str, event_time: DateTime<Utc>) -> bool {
        let bucket = self.bucket(key);
        // Poisoned mutex means logic bug; deny instead of panicking.
        let allowed = match bucket.lock() {
            Ok(mut b) => b.try_take(event_time, self.interval_ns, self.capacity_ns()),
            Err(_) => false,
        };
        allowed
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that are full again at `now`; a full bucket behaves
    /// exactly like a fresh one. `now` is in the same clock as the event
    /// times fed to `is_allowed`. Returns how many were dropped.
    pub fn evict_refilled(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        let capacity_ns = self.capacity_ns();
        self.buckets.retain(|_, bucket| {
            let keep = match bucket.lock() {
                Ok(b) => b.projected(now, capacity_ns) < capacity_ns,
                Err(_) => false,
            };
            keep
        });
        before.saturating_sub(self.buckets.len())
    }

    fn capacity_ns(&self) -> u128 {
        u128::from(self.interval_ns) * u128::from(self.burst)
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(b) = self.buckets.get(key) {
            return Arc::clone(b.value());
        }
        let capacity_ns = self.capacity_ns();
        Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(capacity_ns))))
                .value(),
        )
    }
}
