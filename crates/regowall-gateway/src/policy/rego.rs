//! Rego backend on `regorus`.
//!
//! Every policy becomes its own module under `package firewall.<name>`; the
//! compiler owns that header, so a `package` clause written by the author is
//! dropped. Modules are parsed as Rego v1 (`if` and `contains` keywords).
//! The whole tree is queried once per request as `data.firewall`, which
//! yields one result document per module. Each module is also evaluated on
//! its own before it joins the tree, since rule conflicts only surface at
//! evaluation time.

use std::sync::Arc;

use serde_json::Value;

use regowall_core::{RegowallError, Result};

use super::evaluator::{
    ModuleResult, ModuleSource, PolicyBackend, PolicyEvaluator, ReputationLookup, RequestFacts,
};

pub const ROOT_PACKAGE: &str = "firewall";

/// `ip_in_bucket(policy, bucket, address)`: true while `address` sits in an
/// unexpired entry of that bucket.
pub const LOOKUP_BUILTIN: &str = "ip_in_bucket";

const ROOT_QUERY: &str = "data.firewall";
const DATASET: &str = "<dataset>";

/// Policy names become package path segments.
pub fn is_valid_policy_name(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name != ROOT_PACKAGE
}

/// Module text with the compiler-owned header.
pub fn module_text(name: &str, source: &str) -> String {
    let mut seen_code = false;
    let body: Vec<&str> = source
        .lines()
        .filter(|line| {
            let t = line.trim();
            if t == "import rego.v1" {
                return false;
            }
            if !seen_code && t.starts_with("package ") {
                seen_code = true;
                return false;
            }
            if !t.is_empty() && !t.starts_with('#') {
                seen_code = true;
            }
            true
        })
        .collect();

    format!(
        "package {ROOT_PACKAGE}.{name}\n\nimport rego.v1\n\n{}\n",
        body.join("\n").trim()
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegoBackend;

impl RegoBackend {
    pub fn new() -> Self {
        Self
    }

    fn engine(lookup: ReputationLookup) -> Result<regorus::Engine> {
        let mut engine = regorus::Engine::new();
        engine
            .add_extension(
                LOOKUP_BUILTIN.to_string(),
                3,
                Box::new(
                    move |args: Vec<regorus::Value>| -> anyhow::Result<regorus::Value> {
                        let hit = match args.as_slice() {
                            [regorus::Value::String(policy), regorus::Value::String(bucket), regorus::Value::String(address)] => {
                                lookup(policy.as_ref(), bucket.as_ref(), address.as_ref())
                            }
                            _ => false,
                        };
                        Ok(regorus::Value::Bool(hit))
                    },
                ),
            )
            .map_err(|e| RegowallError::Internal(format!("register {LOOKUP_BUILTIN}: {e}")))?;
        Ok(engine)
    }

    fn attach(engine: &mut regorus::Engine, module: &ModuleSource) -> Result<()> {
        if !is_valid_policy_name(&module.name) {
            return Err(RegowallError::Compilation {
                policy: module.name.clone(),
                reason: format!(
                    "name must be an identifier other than {ROOT_PACKAGE:?}"
                ),
            });
        }
        engine
            .add_policy(
                format!("{}.rego", module.name),
                module_text(&module.name, &module.source),
            )
            .map(|_| ())
            .map_err(|e| RegowallError::Compilation {
                policy: module.name.clone(),
                reason: e.to_string(),
            })
    }

    fn load_dataset(engine: &mut regorus::Engine, dataset: &Value) -> Result<()> {
        let data = serde_json::to_string(dataset).map_err(|e| RegowallError::Compilation {
            policy: DATASET.into(),
            reason: e.to_string(),
        })?;
        engine
            .add_data_json(&data)
            .map_err(|e| RegowallError::Compilation {
                policy: DATASET.into(),
                reason: e.to_string(),
            })
    }
}

impl PolicyBackend for RegoBackend {
    fn check(&self, module: &ModuleSource, dataset: &Value) -> Result<()> {
        let mut engine = Self::engine(Arc::new(|_: &str, _: &str, _: &str| false))?;
        Self::attach(&mut engine, module)?;
        Self::load_dataset(&mut engine, dataset)?;

        let query = format!("{ROOT_QUERY}.{}", module.name);
        run_query(&mut engine, &RequestFacts::default(), &query)
            .map(|_| ())
            .map_err(|e| RegowallError::Compilation {
                policy: module.name.clone(),
                reason: e.to_string(),
            })
    }

    fn build(
        &self,
        modules: &[ModuleSource],
        dataset: &Value,
        lookup: ReputationLookup,
    ) -> Result<Arc<dyn PolicyEvaluator>> {
        let mut engine = Self::engine(lookup)?;
        for module in modules {
            Self::attach(&mut engine, module)?;
        }
        Self::load_dataset(&mut engine, dataset)?;

        let evaluator = RegoEvaluator { engine };
        // Modules that pass alone can still conflict once combined.
        evaluator
            .evaluate(&RequestFacts::default())
            .map_err(|e| RegowallError::Compilation {
                policy: ROOT_PACKAGE.into(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(evaluator))
    }
}

fn run_query(
    engine: &mut regorus::Engine,
    facts: &RequestFacts,
    query: &str,
) -> Result<regorus::QueryResults> {
    let input = serde_json::to_string(facts)
        .map_err(|e| RegowallError::Evaluation(format!("encode input: {e}")))?;
    engine
        .set_input_json(&input)
        .map_err(|e| RegowallError::Evaluation(format!("set input: {e}")))?;
    engine
        .eval_query(query.to_string(), false)
        .map_err(|e| RegowallError::Evaluation(e.to_string()))
}

pub struct RegoEvaluator {
    engine: regorus::Engine,
}

impl PolicyEvaluator for RegoEvaluator {
    fn evaluate(&self, facts: &RequestFacts) -> Result<Vec<ModuleResult>> {
        // Evaluation mutates engine state; work on a private copy.
        let mut engine = self.engine.clone();
        let results = run_query(&mut engine, facts, ROOT_QUERY)?;

        let mut modules = Vec::new();
        for result in results.result {
            for expression in result.expressions {
                let value = serde_json::to_value(&expression.value)
                    .map_err(|e| RegowallError::Evaluation(format!("decode result: {e}")))?;
                match value {
                    Value::Object(per_module) => {
                        modules.extend(
                            per_module
                                .into_iter()
                                .map(|(module, value)| ModuleResult { module, value }),
                        );
                    }
                    other => {
                        tracing::warn!(value = %other, "unexpected {ROOT_QUERY} result shape");
                    }
                }
            }
        }
        Ok(modules)
    }
}
