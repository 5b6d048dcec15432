//! Policy event distribution.
//!
//! A topic is split into partitions; each record has an offset within its
//! partition. Consumer groups commit the offset of the next record they want,
//! so a partition's backlog is `high watermark - committed`. Events are keyed
//! by policy name, which keeps per-name ordering inside one partition.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use regowall_core::{PolicyEvent, Result};

pub use memory::InMemoryBus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
}

/// `low` is the oldest retained offset, `high` the next offset to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

#[async_trait]
pub trait DistributionChannel: Send + Sync {
    async fn publish(&self, topic: &str, event: &PolicyEvent) -> Result<DeliveryReport>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next record. Cancel-safe: dropping the future loses
    /// nothing.
    async fn next(&mut self) -> Result<Delivery>;

    /// Mark `delivery` (and everything before it in its partition) done.
    fn commit(&mut self, delivery: &Delivery) -> Result<()>;

    fn assignment(&self) -> Vec<u32>;

    /// Next offset the group wants from `partition`, if it ever committed.
    fn committed(&self, partition: u32) -> Result<Option<u64>>;

    fn watermarks(&self, partition: u32) -> Result<Watermarks>;
}

/// Records the subscription's group has not committed yet, over its
/// assigned partitions.
pub fn backlog(subscription: &dyn Subscription) -> Result<u64> {
    let mut parts = Vec::new();
    for partition in subscription.assignment() {
        parts.push((
            subscription.watermarks(partition)?,
            subscription.committed(partition)?,
        ));
    }
    Ok(backlog_of(parts))
}

/// Σ (high − committed); an unset committed offset counts as the low
/// watermark.
pub fn backlog_of<I>(parts: I) -> u64
where
    I: IntoIterator<Item = (Watermarks, Option<u64>)>,
{
    parts
        .into_iter()
        .map(|(marks, committed)| marks.high.saturating_sub(committed.unwrap_or(marks.low)))
        .sum()
}
