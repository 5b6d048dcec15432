//! Axum router wiring.
//!
//! Everything under `/_firewall/` is ops and introspection; any other path
//! is a request to decide on.

use axum::{
    routing::{get, post},
    Router,
};

use crate::{app_state::AppState, ops, transport::http};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_firewall/healthz", get(ops::healthz))
        .route("/_firewall/readyz", get(ops::readyz))
        .route("/_firewall/metrics", get(ops::metrics))
        .route("/_firewall/reputation", get(http::reputation))
        .route("/_firewall/policies", get(http::policies))
        .route("/_firewall/events", post(http::publish_event))
        .fallback(http::decide)
        .with_state(state)
}
