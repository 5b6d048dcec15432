//! Request-time verdicts.
//!
//! Module results are folded in ascending module-name order; each module's
//! `allow`/`deny`, when present, overwrites the running value. The request is
//! denied only when the final `deny` is set and the final `allow` is not.
//! Evaluation never blocks on a compilation and any failure fails open.

use std::sync::Arc;

use serde::Serialize;

use regowall_core::Result;

use super::compiler::LiveSnapshot;
use crate::obs::metrics::FirewallMetrics;
use super::evaluator::{ModuleOutcome, ModuleResult, RequestFacts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allow: bool,
    /// Modules whose `deny` was true.
    pub deny_triggers: Vec<String>,
    pub modules_evaluated: usize,
    /// Snapshot generation that produced the verdict.
    pub generation: u64,
}

impl Verdict {
    /// Allow without having evaluated anything.
    pub fn fail_open(generation: u64) -> Self {
        Self {
            allow: true,
            deny_triggers: Vec::new(),
            modules_evaluated: 0,
            generation,
        }
    }
}

/// Reduce per-module results to one verdict. Empty input allows.
pub fn merge(results: &[ModuleResult]) -> Verdict {
    let mut ordered: Vec<&ModuleResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.module.cmp(&b.module));

    let mut allow = false;
    let mut deny = false;
    let mut deny_triggers = Vec::new();

    for result in &ordered {
        if let ModuleOutcome::Decision {
            allow: module_allow,
            deny: module_deny,
        } = ModuleOutcome::decode(result)
        {
            if let Some(a) = module_allow {
                allow = a;
            }
            if let Some(d) = module_deny {
                deny = d;
                if d {
                    deny_triggers.push(result.module.clone());
                }
            }
        }
    }

    Verdict {
        allow: !(deny && !allow),
        deny_triggers,
        modules_evaluated: ordered.len(),
        generation: 0,
    }
}

#[derive(Clone)]
pub struct DecisionEngine {
    live: Arc<LiveSnapshot>,
    metrics: Arc<FirewallMetrics>,
}

impl DecisionEngine {
    pub fn new(live: Arc<LiveSnapshot>, metrics: Arc<FirewallMetrics>) -> Self {
        Self { live, metrics }
    }

    /// Verdict for `facts`; evaluation errors are counted by kind and allow
    /// the request.
    pub fn evaluate(&self, facts: &RequestFacts) -> Verdict {
        match self.try_evaluate(facts) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.metrics
                    .evaluation_errors
                    .inc(&[("kind", e.kind().as_str())]);
                let generation = self.live.load().generation;
                tracing::warn!(error = %e, generation, host = %facts.host, "policy evaluation failed, allowing");
                Verdict::fail_open(generation)
            }
        }
    }

    pub fn try_evaluate(&self, facts: &RequestFacts) -> Result<Verdict> {
        let snapshot = self.live.load();
        let Some(evaluator) = snapshot.evaluator.as_ref() else {
            return Ok(Verdict::fail_open(snapshot.generation));
        };

        let results = evaluator.evaluate(facts)?;
        let mut verdict = merge(&results);
        verdict.generation = snapshot.generation;

        for module in &verdict.deny_triggers {
            tracing::info!(module = %module, ip = %facts.ip, host = %facts.host, path = %facts.path, "deny rule triggered");
        }
        Ok(verdict)
    }
}
