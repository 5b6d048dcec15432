//! Authoritative in-memory set of policy definitions.
//!
//! Mutated only by validated events; the consumer is the single writer and
//! the compiler takes a coherent copy under the read lock.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use regowall_core::{EventType, PolicyEvent, RegowallError, ReputationBuckets, Result};

/// Latest FULL for a name plus everything PATCHed on top of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDefinition {
    pub name: String,
    #[serde(rename = "rego")]
    pub rule_source: String,
    pub data: Option<Value>,
    #[serde(rename = "ipbuckets")]
    pub reputation_buckets: ReputationBuckets,
    /// Number of events applied since the last FULL replaced the definition.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// What an applied event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Replaced,
    Patched,
}

impl Applied {
    /// Rule text changed, so the evaluator must be rebuilt promptly.
    pub fn needs_recompile(self) -> bool {
        !matches!(self, Applied::Patched)
    }
}

#[derive(Debug, Default)]
pub struct PolicyStore {
    inner: RwLock<BTreeMap<String, PolicyDefinition>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &PolicyEvent, now: DateTime<Utc>) -> Result<Applied> {
        match event.kind {
            EventType::Full => self.apply_full(event, now),
            EventType::Patch => self.apply_patch(event, now),
        }
    }

    /// Replace (or create) the definition named by a FULL event.
    pub fn apply_full(&self, event: &PolicyEvent, now: DateTime<Utc>) -> Result<Applied> {
        event.validate()?;
        if event.kind != EventType::Full {
            return Err(RegowallError::Validation(format!(
                "expected FULL event for policy {}, got {}",
                event.name,
                event.kind.as_str()
            )));
        }

        let mut reputation_buckets = ReputationBuckets::new();
        if let Some(buckets) = &event.reputation_buckets {
            merge_buckets(&event.name, &mut reputation_buckets, buckets, now);
        }

        let definition = PolicyDefinition {
            name: event.name.clone(),
            rule_source: event.rule_source.clone(),
            data: event.data.clone(),
            reputation_buckets,
            revision: 1,
            updated_at: now,
        };

        let previous = self.write()?.insert(event.name.clone(), definition);
        tracing::info!(policy = %event.name, replaced = previous.is_some(), "policy definition applied");
        Ok(if previous.is_some() {
            Applied::Replaced
        } else {
            Applied::Created
        })
    }

    /// Merge a PATCH into an existing definition. Rejected when no FULL for
    /// the name has been applied yet.
    pub fn apply_patch(&self, event: &PolicyEvent, now: DateTime<Utc>) -> Result<Applied> {
        event.validate()?;
        if event.kind != EventType::Patch {
            return Err(RegowallError::Validation(format!(
                "expected PATCH event for policy {}, got {}",
                event.name,
                event.kind.as_str()
            )));
        }

        let mut guard = self.write()?;
        let Some(definition) = guard.get_mut(&event.name) else {
            return Err(RegowallError::Validation(format!(
                "policy {} not found, PATCH requires a prior FULL",
                event.name
            )));
        };

        if let Some(data) = &event.data {
            merge_data(&mut definition.data, data.clone());
        }
        if let Some(buckets) = &event.reputation_buckets {
            merge_buckets(&event.name, &mut definition.reputation_buckets, buckets, now);
        }
        definition.revision += 1;
        definition.updated_at = now;

        tracing::debug!(policy = %event.name, revision = definition.revision, "policy patched");
        Ok(Applied::Patched)
    }

    pub fn get(&self, name: &str) -> Result<Option<PolicyDefinition>> {
        Ok(self.read()?.get(name).cloned())
    }

    /// Coherent copy of every definition, ordered by name.
    pub fn definitions(&self) -> Result<Vec<PolicyDefinition>> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Drop bucket entries that expired at or before `now`. Returns how many.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut guard = self.write()?;
        let mut purged = 0;
        for definition in guard.values_mut() {
            for entries in definition.reputation_buckets.values_mut() {
                let before = entries.len();
                entries.retain(|_, expires_at| *expires_at > now);
                purged += before - entries.len();
            }
        }
        Ok(purged)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, PolicyDefinition>>> {
        self.inner
            .read()
            .map_err(|_| RegowallError::Internal("policy store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, PolicyDefinition>>> {
        self.inner
            .write()
            .map_err(|_| RegowallError::Internal("policy store lock poisoned".into()))
    }
}

/// Top-level keys of an object patch overwrite; anything else replaces.
fn merge_data(current: &mut Option<Value>, patch: Value) {
    match (current.as_mut(), patch) {
        (Some(Value::Object(existing)), Value::Object(update)) => existing.extend(update),
        (_, patch) => *current = Some(patch),
    }
}

/// Entries already expired are skipped; a re-added address keeps the later
/// expiry so duplicate or reordered deliveries converge.
fn merge_buckets(
    policy: &str,
    target: &mut ReputationBuckets,
    incoming: &ReputationBuckets,
    now: DateTime<Utc>,
) {
    for (bucket, entries) in incoming {
        let slot = target.entry(bucket.clone()).or_default();
        for (address, expires_at) in entries {
            if *expires_at <= now {
                tracing::debug!(policy, bucket = %bucket, address = %address, "skipping expired bucket entry");
                continue;
            }
            slot.entry(address.clone())
                .and_modify(|current| *current = (*current).max(*expires_at))
                .or_insert(*expires_at);
        }
    }
}
