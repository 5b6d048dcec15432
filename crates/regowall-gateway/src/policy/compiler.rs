//! Store contents -> immutable, atomically swappable snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use regowall_core::{FlatExport, ReputationIndex, Result};

use super::evaluator::{ModuleSource, PolicyBackend, PolicyEvaluator, ReputationLookup};
use super::rego::ROOT_PACKAGE;
use super::store::PolicyDefinition;

/// One reputation index per (policy, bucket).
#[derive(Debug, Clone, Default)]
pub struct ReputationSet {
    indices: BTreeMap<(String, String), ReputationIndex>,
}

impl ReputationSet {
    pub fn index(&self, policy: &str, bucket: &str) -> Option<&ReputationIndex> {
        self.indices.get(&(policy.to_string(), bucket.to_string()))
    }

    /// Present in `policy`'s `bucket` and not expired at `now`.
    pub fn lookup(&self, policy: &str, bucket: &str, address: &str, now: DateTime<Utc>) -> bool {
        self.index(policy, bucket)
            .is_some_and(|idx| idx.is_active(address, now))
    }

    /// Total entries across every index.
    pub fn len(&self) -> usize {
        self.indices.values().map(ReputationIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// policy -> bucket -> flattened index.
    pub fn export(&self) -> BTreeMap<String, BTreeMap<String, FlatExport>> {
        let mut out: BTreeMap<String, BTreeMap<String, FlatExport>> = BTreeMap::new();
        for ((policy, bucket), idx) in &self.indices {
            out.entry(policy.clone())
                .or_default()
                .insert(bucket.clone(), idx.export());
        }
        out
    }
}

pub struct CompiledSnapshot {
    pub generation: u64,
    pub compiled_at: DateTime<Utc>,
    /// `None` only for the placeholder served before the first compilation.
    pub evaluator: Option<Arc<dyn PolicyEvaluator>>,
    pub dataset: Value,
    pub reputation: Arc<ReputationSet>,
    pub compiled: Vec<String>,
    pub skipped: Vec<String>,
}

impl CompiledSnapshot {
    /// Generation 0: no evaluator, every request is allowed.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            compiled_at: Utc::now(),
            evaluator: None,
            dataset: Value::Object(Map::new()),
            reputation: Arc::new(ReputationSet::default()),
            compiled: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl std::fmt::Debug for CompiledSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSnapshot")
            .field("generation", &self.generation)
            .field("compiled_at", &self.compiled_at)
            .field("compiled", &self.compiled)
            .field("skipped", &self.skipped)
            .field("reputation_entries", &self.reputation.len())
            .finish()
    }
}

/// Live snapshot slot. Readers never wait for a compilation.
pub struct LiveSnapshot {
    current: ArcSwap<CompiledSnapshot>,
}

impl LiveSnapshot {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(CompiledSnapshot::empty()),
        }
    }

    pub fn load(&self) -> Arc<CompiledSnapshot> {
        self.current.load_full()
    }

    pub fn store(&self, snapshot: Arc<CompiledSnapshot>) {
        self.current.store(snapshot);
    }
}

impl Default for LiveSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Compiler {
    backend: Arc<dyn PolicyBackend>,
    generation: AtomicU64,
}

impl Compiler {
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self {
            backend,
            generation: AtomicU64::new(0),
        }
    }

    /// Build a snapshot from `definitions`.
    ///
    /// Policies whose rules fail to check are skipped; bad or expired bucket
    /// entries are skipped. If the combined build still fails, each module is
    /// built alone and the ones that fail are skipped too. An error means no
    /// usable set remained and the caller should keep serving its previous
    /// snapshot.
    pub fn compile(
        &self,
        definitions: &[PolicyDefinition],
        now: DateTime<Utc>,
    ) -> Result<CompiledSnapshot> {
        let dataset = merge_dataset(definitions);

        let mut modules = Vec::with_capacity(definitions.len());
        let mut skipped = Vec::new();
        for definition in definitions {
            let module = ModuleSource {
                name: definition.name.clone(),
                source: definition.rule_source.clone(),
            };
            match self.backend.check(&module, &dataset) {
                Ok(()) => modules.push(module),
                Err(e) => {
                    tracing::warn!(policy = %definition.name, error = %e, "skipping policy that failed to compile");
                    skipped.push(definition.name.clone());
                }
            }
        }

        let reputation = Arc::new(build_reputation(definitions, now));

        let reader = Arc::clone(&reputation);
        let lookup: ReputationLookup = Arc::new(move |policy: &str, bucket: &str, address: &str| {
            reader.lookup(policy, bucket, address, Utc::now())
        });

        let evaluator = match self.backend.build(&modules, &dataset, Arc::clone(&lookup)) {
            Ok(evaluator) => evaluator,
            Err(e) if modules.len() > 1 => {
                tracing::warn!(error = %e, "combined build failed; isolating policies");
                modules.retain(|module| {
                    let alone = std::slice::from_ref(module);
                    match self.backend.build(alone, &dataset, Arc::clone(&lookup)) {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::warn!(policy = %module.name, error = %e, "skipping policy that failed to build");
                            skipped.push(module.name.clone());
                            false
                        }
                    }
                });
                skipped.sort();
                self.backend.build(&modules, &dataset, lookup)?
            }
            Err(e) => return Err(e),
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let compiled: Vec<String> = modules.into_iter().map(|m| m.name).collect();
        tracing::info!(
            generation,
            compiled = compiled.len(),
            skipped = skipped.len(),
            reputation_entries = reputation.len(),
            "policies compiled"
        );

        Ok(CompiledSnapshot {
            generation,
            compiled_at: now,
            evaluator: Some(evaluator),
            dataset,
            reputation,
            compiled,
            skipped,
        })
    }
}

/// `{<policy>: <data>}` for every definition that carries data.
///
/// The reserved root name is left out; its data would shadow the compiled
/// policy tree.
fn merge_dataset(definitions: &[PolicyDefinition]) -> Value {
    let merged: Map<String, Value> = definitions
        .iter()
        .filter(|d| d.name != ROOT_PACKAGE)
        .filter_map(|d| d.data.clone().map(|data| (d.name.clone(), data)))
        .collect();
    Value::Object(merged)
}

fn build_reputation(definitions: &[PolicyDefinition], now: DateTime<Utc>) -> ReputationSet {
    let mut set = ReputationSet::default();
    for definition in definitions {
        for (bucket, entries) in &definition.reputation_buckets {
            let mut idx = ReputationIndex::new();
            for (address, expires_at) in entries {
                if *expires_at <= now {
                    tracing::debug!(policy = %definition.name, bucket = %bucket, address = %address, "dropping expired entry");
                    continue;
                }
                match idx.insert(address, *expires_at) {
                    Ok(next) => idx = next,
                    Err(e) => {
                        tracing::warn!(policy = %definition.name, bucket = %bucket, error = %e, "skipping bucket entry");
                    }
                }
            }
            set.indices
                .insert((definition.name.clone(), bucket.clone()), idx);
        }
    }
    set
}
