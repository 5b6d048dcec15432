//! regowall core: transport-agnostic policy primitives.
//!
//! This crate defines the policy-event wire contract, the shared error
//! surface, the persistent reputation index, and the event-time rate limiter.
//! It carries no runtime, HTTP, or policy-language dependencies so producers
//! and enforcement processes can share it.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here. Malformed events
//! and addresses surface as `RegowallError` so a single bad input never takes
//! a process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod event;
pub mod radix;
pub mod ratelimit;
pub mod reputation;

/// Shared result type.
pub use error::{ErrorKind, RegowallError, Result};
pub use event::{EventType, PolicyEvent, ReputationBuckets};
pub use ratelimit::RateLimiter;
pub use reputation::{AddressFamily, FlatExport, ReputationIndex};
