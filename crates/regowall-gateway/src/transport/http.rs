//! HTTP surface: the decision fallback plus introspection and ingress.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;

use regowall_core::{PolicyEvent, RegowallError};

use crate::app_state::AppState;
use crate::policy::RequestFacts;

/// Build evaluator input from request parts.
///
/// The source address is the first `x-forwarded-for` entry, falling back to
/// the peer address.
pub fn facts_from_parts(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> RequestFacts {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let mut header_map = std::collections::BTreeMap::<String, Vec<String>>::new();
    for (name, value) in headers {
        header_map
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let ip = forwarded
        .or_else(|| peer.map(|p| p.ip().to_canonical().to_string()))
        .unwrap_or_default();

    RequestFacts {
        host,
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        headers: header_map,
        ip,
    }
}

/// Every path outside `/_firewall/`: 200 allows, 429 denies.
pub async fn decide(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let facts = facts_from_parts(&method, &uri, &headers, peer.map(|ConnectInfo(addr)| addr));

    let started = Instant::now();
    let verdict = state.decisions().evaluate(&facts);
    state
        .metrics()
        .evaluation_duration
        .observe(&[], started.elapsed());

    let (status, label) = if verdict.allow {
        (StatusCode::OK, "allow")
    } else {
        (StatusCode::TOO_MANY_REQUESTS, "deny")
    };
    state.metrics().decisions.inc(&[("verdict", label)]);

    (status, Json(verdict)).into_response()
}

/// Flattened reputation indices of the live snapshot.
pub async fn reputation(State(state): State<AppState>) -> Response {
    let snapshot = state.live().load();
    Json(json!({
        "generation": snapshot.generation,
        "compiled_at": snapshot.compiled_at,
        "buckets": snapshot.reputation.export(),
    }))
    .into_response()
}

pub async fn policies(State(state): State<AppState>) -> Response {
    match state.store().definitions() {
        Ok(definitions) => {
            let snapshot = state.live().load();
            Json(json!({
                "generation": snapshot.generation,
                "compiled": snapshot.compiled,
                "skipped": snapshot.skipped,
                "policies": definitions,
            }))
            .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// Producer ingress: validate and publish one policy event.
pub async fn publish_event(State(state): State<AppState>, body: Bytes) -> Response {
    let event = match PolicyEvent::from_json(&body).and_then(|event| {
        event.validate()?;
        Ok(event)
    }) {
        Ok(event) => event,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    let topic = state.cfg().channel.topic.clone();
    match state.channel().publish(&topic, &event).await {
        Ok(report) => (StatusCode::ACCEPTED, Json(report)).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e),
    }
}

fn error_response(status: StatusCode, e: &RegowallError) -> Response {
    (
        status,
        Json(json!({ "code": e.kind().as_str(), "msg": e.to_string() })),
    )
        .into_response()
}
