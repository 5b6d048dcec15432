//! Seam between the firewall and a policy language.
//!
//! A [`PolicyBackend`] syntax-checks individual modules and builds an
//! immutable [`PolicyEvaluator`] from all modules that passed. Reputation
//! lookups reach the evaluator as a plain closure, so neither side depends on
//! the other's types.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use regowall_core::Result;

/// `(policy, bucket, address) -> present and not expired`.
pub type ReputationLookup = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

/// Facts about one request, serialized as the evaluator's `input`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestFacts {
    pub host: String,
    pub method: String,
    pub path: String,
    /// Lower-cased header name -> all values.
    pub headers: BTreeMap<String, Vec<String>>,
    pub ip: String,
}

/// One policy as handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSource {
    pub name: String,
    pub source: String,
}

/// Raw result document of one module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleResult {
    pub module: String,
    pub value: Value,
}

pub trait PolicyBackend: Send + Sync {
    /// Check one module on its own against the merged `dataset`.
    fn check(&self, module: &ModuleSource, dataset: &Value) -> Result<()>;

    /// Attach every module, register `lookup` and finalize against `dataset`.
    fn build(
        &self,
        modules: &[ModuleSource],
        dataset: &Value,
        lookup: ReputationLookup,
    ) -> Result<Arc<dyn PolicyEvaluator>>;
}

pub trait PolicyEvaluator: Send + Sync {
    /// Per-module result documents, in no particular order.
    fn evaluate(&self, facts: &RequestFacts) -> Result<Vec<ModuleResult>>;
}

/// What a module said about the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOutcome {
    /// Result shape not understood; ignored by the merge.
    Unknown,
    Decision {
        allow: Option<bool>,
        deny: Option<bool>,
    },
}

impl ModuleOutcome {
    /// Decode a module document. Non-boolean `allow`/`deny` values are
    /// logged and treated as absent.
    pub fn decode(result: &ModuleResult) -> Self {
        let Value::Object(fields) = &result.value else {
            tracing::warn!(module = %result.module, value = %result.value, "module result is not an object");
            return ModuleOutcome::Unknown;
        };

        let flag = |key: &str| match fields.get(key) {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                tracing::warn!(module = %result.module, key, value = %other, "unsupported result type");
                None
            }
        };

        ModuleOutcome::Decision {
            allow: flag("allow"),
            deny: flag("deny"),
        }
    }
}
