//! In-process partitioned log.
//!
//! Each partition keeps at most `retention` records; older ones are dropped
//! and the low watermark advances. Groups remember committed offsets, and a
//! group that never committed starts at the low watermark, so a late
//! subscriber still sees every retained FULL event. A subscriber is assigned
//! every partition of the topic.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use regowall_core::{PolicyEvent, RegowallError, Result};

use super::{Delivery, DeliveryReport, DistributionChannel, Subscription, Watermarks};

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct PartitionLog {
    low: u64,
    records: VecDeque<Record>,
}

impl PartitionLog {
    fn high(&self) -> u64 {
        self.low + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let idx = offset.checked_sub(self.low)?;
        self.records.get(usize::try_from(idx).ok()?)
    }
}

#[derive(Debug)]
struct Topic {
    name: String,
    partitions: Vec<Mutex<PartitionLog>>,
    groups: DashMap<String, Arc<Mutex<Vec<Option<u64>>>>>,
    published: Notify,
}

impl Topic {
    fn partition(&self, partition: u32) -> Result<MutexGuard<'_, PartitionLog>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| {
                RegowallError::Channel(format!(
                    "topic {} has no partition {partition}",
                    self.name
                ))
            })?
            .lock()
            .map_err(|_| RegowallError::Channel(format!("topic {} partition lock poisoned", self.name)))
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Debug)]
struct BusInner {
    partitions: u32,
    retention: usize,
    topics: DashMap<String, Arc<Topic>>,
}

impl InMemoryBus {
    pub fn new(partitions: u32, retention: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                topics: DashMap::new(),
            }),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let partitions = self.inner.partitions;
        Arc::clone(
            self.inner
                .topics
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Topic {
                        name: name.to_string(),
                        partitions: (0..partitions)
                            .map(|_| Mutex::new(PartitionLog::default()))
                            .collect(),
                        groups: DashMap::new(),
                        published: Notify::new(),
                    })
                })
                .value(),
        )
    }

    /// Publish pre-encoded bytes under `key`.
    pub fn publish_raw(&self, topic: &str, key: &str, payload: Bytes) -> Result<DeliveryReport> {
        let t = self.topic(topic);
        let partition = t.partition_for(key);
        let offset = {
            let mut log = t.partition(partition)?;
            let offset = log.high();
            log.records.push_back(Record {
                key: key.to_string(),
                payload,
            });
            while log.records.len() > self.inner.retention {
                log.records.pop_front();
                log.low += 1;
            }
            offset
        };
        t.published.notify_waiters();

        Ok(DeliveryReport {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }
}

#[async_trait]
impl DistributionChannel for InMemoryBus {
    async fn publish(&self, topic: &str, event: &PolicyEvent) -> Result<DeliveryReport> {
        let payload = Bytes::from(event.to_json()?);
        let report = self.publish_raw(topic, &event.name, payload)?;
        tracing::debug!(
            policy = %event.name,
            kind = event.kind.as_str(),
            partition = report.partition,
            offset = report.offset,
            "policy event published"
        );
        Ok(report)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let t = self.topic(topic);
        let committed = Arc::clone(
            t.groups
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(vec![None; t.partitions.len()])))
                .value(),
        );

        let mut positions = Vec::with_capacity(t.partitions.len());
        {
            let offsets = lock_offsets(&committed)?;
            for (partition, start) in offsets.iter().enumerate() {
                let low = t.partition(partition as u32)?.low;
                positions.push(start.unwrap_or(low).max(low));
            }
        }

        tracing::info!(topic, group, partitions = positions.len(), "subscribed");
        Ok(Box::new(MemorySubscription {
            topic: t,
            committed,
            positions,
            cursor: 0,
        }))
    }
}

fn lock_offsets(offsets: &Mutex<Vec<Option<u64>>>) -> Result<MutexGuard<'_, Vec<Option<u64>>>> {
    offsets
        .lock()
        .map_err(|_| RegowallError::Channel("group offsets lock poisoned".into()))
}

struct MemorySubscription {
    topic: Arc<Topic>,
    committed: Arc<Mutex<Vec<Option<u64>>>>,
    /// Next offset to read, per partition.
    positions: Vec<u64>,
    /// Round-robin start so one busy partition cannot starve the others.
    cursor: usize,
}

impl MemorySubscription {
    fn poll(&mut self) -> Result<Option<Delivery>> {
        let count = self.positions.len();
        for step in 0..count {
            let partition = (self.cursor + step) % count;
            let log = self.topic.partition(partition as u32)?;

            // Records behind the low watermark were dropped by retention.
            let position = self.positions[partition].max(log.low);
            if let Some(record) = log.get(position) {
                let delivery = Delivery {
                    topic: self.topic.name.clone(),
                    partition: partition as u32,
                    offset: position,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                };
                drop(log);
                self.positions[partition] = position + 1;
                self.cursor = (partition + 1) % count;
                return Ok(Some(delivery));
            }
            self.positions[partition] = position;
        }
        Ok(None)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery> {
        let topic = Arc::clone(&self.topic);
        loop {
            let notified = topic.published.notified();
            tokio::pin!(notified);
            // Register before polling so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some(delivery) = self.poll()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut offsets = lock_offsets(&self.committed)?;
        let slot = offsets
            .get_mut(delivery.partition as usize)
            .ok_or_else(|| RegowallError::Channel(format!("unknown partition {}", delivery.partition)))?;
        let next = delivery.offset + 1;
        *slot = Some(slot.map_or(next, |current| current.max(next)));
        Ok(())
    }

    fn assignment(&self) -> Vec<u32> {
        (0..self.positions.len() as u32).collect()
    }

    fn committed(&self, partition: u32) -> Result<Option<u64>> {
        Ok(lock_offsets(&self.committed)?
            .get(partition as usize)
            .copied()
            .flatten())
    }

    fn watermarks(&self, partition: u32) -> Result<Watermarks> {
        let log = self.topic.partition(partition)?;
        Ok(Watermarks {
            low: log.low,
            high: log.high(),
        })
    }
}
