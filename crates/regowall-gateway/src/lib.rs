//! regowall gateway library entry.
//!
//! Wires the policy store, compiler, decision engine, event channel and
//! background loops into the enforcement service. Consumed by the binary
//! (`main.rs`) and by integration tests.

pub mod app_state;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod obs;
pub mod ops;
pub mod policy;
pub mod producer;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod transport;
