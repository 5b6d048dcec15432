//! Policy state, compilation and request-time decisions.
//!
//! - `store`: authoritative definitions, mutated by FULL/PATCH events
//! - `compiler`: definitions -> swappable `CompiledSnapshot`
//! - `evaluator` / `rego`: policy-language seam and its `regorus` backend
//! - `decision`: per-module merge and fail-open evaluation

pub mod compiler;
pub mod decision;
pub mod evaluator;
pub mod rego;
pub mod store;

pub use compiler::{CompiledSnapshot, Compiler, LiveSnapshot, ReputationSet};
pub use decision::{merge, DecisionEngine, Verdict};
pub use evaluator::{
    ModuleOutcome, ModuleResult, ModuleSource, PolicyBackend, PolicyEvaluator, ReputationLookup,
    RequestFacts,
};
pub use rego::RegoBackend;
pub use store::{Applied, PolicyDefinition, PolicyStore};
