//! Top-level facade crate for regowall.
//!
//! Re-exports the core primitives and the gateway library so users can depend
//! on a single crate.

pub mod core {
    pub use regowall_core::*;
}

pub mod gateway {
    pub use regowall_gateway::*;
}
