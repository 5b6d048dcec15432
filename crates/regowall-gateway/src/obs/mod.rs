//! Lightweight in-process metrics, rendered by the `/_firewall/metrics`
//! handler in Prometheus text format.

pub mod metrics;
