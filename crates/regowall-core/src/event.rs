//! Policy event wire format (JSON on the bus, YAML for static bootstrap).
//!
//! ```json
//! {"type": "PATCH", "name": "nouseragent", "rego": "", "data": null,
//!  "ipbuckets": {"blacklist": {"40.127.145.4": "2020-03-11T12:05:57+01:00"}}}
//! ```
//!
//! Validation lives here so producers (pre-publish) and consumers (pre-apply)
//! enforce exactly the same rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RegowallError, Result};

/// bucket name -> address -> expiration.
pub type ReputationBuckets = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

/// Event kind. Static documents may spell it in lower case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Complete replacement of a named policy.
    #[serde(rename = "FULL", alias = "full")]
    Full,
    /// Incremental bucket (and data) additions to an existing policy.
    #[serde(rename = "PATCH", alias = "patch")]
    Patch,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Full => "FULL",
            EventType::Patch => "PATCH",
        }
    }
}

/// Unit of policy state transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvent {
    #[serde(rename = "type")]
    pub kind: EventType,

    /// Unique policy name; last FULL wins.
    pub name: String,

    /// Declarative rule source (FULL only). The package clause is owned by
    /// the compiler, see `regowall_gateway::policy::rego`.
    #[serde(rename = "rego", default, skip_serializing_if = "String::is_empty")]
    pub rule_source: String,

    /// Auxiliary dataset, reachable as `data.<name>` from every policy.
    #[serde(default)]
    pub data: Option<Value>,

    /// Reputation buckets carried by this event.
    #[serde(rename = "ipbuckets", default)]
    pub reputation_buckets: Option<ReputationBuckets>,
}

impl PolicyEvent {
    /// FULL event with the given rule source.
    pub fn full(name: impl Into<String>, rule_source: impl Into<String>) -> Self {
        Self {
            kind: EventType::Full,
            name: name.into(),
            rule_source: rule_source.into(),
            data: None,
            reputation_buckets: None,
        }
    }

    /// Empty PATCH event; add entries with [`PolicyEvent::with_bucket_entry`].
    pub fn patch(name: impl Into<String>) -> Self {
        Self {
            kind: EventType::Patch,
            name: name.into(),
            rule_source: String::new(),
            data: None,
            reputation_buckets: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_bucket_entry(
        mut self,
        bucket: impl Into<String>,
        address: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.reputation_buckets
            .get_or_insert_with(BTreeMap::new)
            .entry(bucket.into())
            .or_default()
            .insert(address.into(), expires_at);
        self
    }

    /// Decode a bus payload. Unknown or missing `type` is a validation error.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| RegowallError::Validation(format!("malformed policy event: {e}")))
    }

    /// Encode for the bus.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| RegowallError::Internal(format!("encode policy event {}: {e}", self.name)))
    }

    /// Structural validation shared by producers and consumers.
    ///
    /// The "PATCH needs a prior FULL" rule depends on store state and is
    /// checked by the store.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RegowallError::Validation("missing policy name".into()));
        }

        match self.kind {
            EventType::Full => {
                if self.rule_source.trim().is_empty() {
                    return Err(RegowallError::Validation(format!(
                        "rego is missing for policy {}",
                        self.name
                    )));
                }
            }
            EventType::Patch => {
                if self.data.is_none() && self.reputation_buckets.is_none() {
                    return Err(RegowallError::Validation(format!(
                        "data or ipbuckets missing for policy {}",
                        self.name
                    )));
                }
            }
        }

        if let Some(data) = &self.data {
            ensure_json_compatible(&self.name, data)?;
        }
        Ok(())
    }
}

/// `data` must survive an encode/decode cycle; anything else is rejected
/// instead of being silently dropped at compile time.
fn ensure_json_compatible(name: &str, data: &Value) -> Result<()> {
    let encoded = serde_json::to_vec(data).map_err(|e| {
        RegowallError::Validation(format!("data of policy {name} is not JSON-serializable: {e}"))
    })?;
    serde_json::from_slice::<Value>(&encoded).map_err(|e| {
        RegowallError::Validation(format!("data of policy {name} does not round-trip: {e}"))
    })?;
    Ok(())
}
