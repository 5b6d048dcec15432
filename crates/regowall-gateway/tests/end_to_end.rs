#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::Value;
use tower::ServiceExt;

use regowall_core::{PolicyEvent, RegowallError, Result};
use regowall_gateway::app_state::AppState;
use regowall_gateway::channel::{DistributionChannel, InMemoryBus, Subscription};
use regowall_gateway::policy::{
    CompiledSnapshot, ModuleResult, PolicyEvaluator, RegoBackend, RequestFacts,
};
use regowall_gateway::{config, consumer, router, scheduler};

const EDGE_RULES: &str = r#"
package ignored.by.compiler

deny if {
	input.host == "api.example.com"
	ip_in_bucket("edge", "abuse", input.ip)
}
"#;

fn state() -> AppState {
    let cfg = config::load_from_str("version: 1\nchannel: { endpoints: [\"memory://local\"] }\n")
        .unwrap();
    AppState::new(cfg, Arc::new(InMemoryBus::new(2, 64)), Arc::new(RegoBackend::new()))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn visit(host: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/v1/orders?page=2")
        .header("host", host)
        .header("x-forwarded-for", format!("{ip}, 10.0.0.1"))
        .body(Body::empty())
        .unwrap()
}

fn publish(event: &PolicyEvent) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/_firewall/events")
        .header("content-type", "application/json")
        .body(Body::from(event.to_json().unwrap()))
        .unwrap()
}

/// Apply everything currently on the topic, then compile.
async fn converge(state: &AppState) {
    let mut sub = state
        .channel()
        .subscribe(&state.cfg().channel.topic, "e2e")
        .await
        .unwrap();
    while regowall_gateway::channel::backlog(sub.as_ref()).unwrap() > 0 {
        let delivery = sub.next().await.unwrap();
        consumer::handle_delivery(state, sub.as_mut(), &delivery);
    }
    scheduler::compile_now(state).await.unwrap();
}

#[tokio::test]
async fn patch_flips_a_request_from_allowed_to_denied() {
    let state = state();
    let app = router::build_router(state.clone());

    let (status, _) = call(&app, publish(&PolicyEvent::full("edge", EDGE_RULES))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    converge(&state).await;

    let (status, body) = call(&app, visit("api.example.com", "9.9.9.9")).await;
    assert_eq!(status, StatusCode::OK);
    let verdict: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(verdict["allow"], true);

    let patch = PolicyEvent::patch("edge").with_bucket_entry(
        "abuse",
        "9.9.9.9",
        Utc::now() + Duration::hours(1),
    );
    let (status, _) = call(&app, publish(&patch)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    converge(&state).await;

    let (status, body) = call(&app, visit("api.example.com", "9.9.9.9")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let verdict: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(verdict["allow"], false);
    assert_eq!(verdict["deny_triggers"], serde_json::json!(["edge"]));

    // other addresses and hosts are untouched
    let (status, _) = call(&app, visit("api.example.com", "9.9.9.8")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, visit("www.example.com", "9.9.9.9")).await;
    assert_eq!(status, StatusCode::OK);

    let metrics = state.metrics();
    assert_eq!(metrics.decisions.get(&[("verdict", "deny")]), 1);
    assert_eq!(metrics.decisions.get(&[("verdict", "allow")]), 3);
}

#[tokio::test]
async fn introspection_reflects_the_live_snapshot() {
    let state = state();
    let app = router::build_router(state.clone());

    let event = PolicyEvent::full("edge", EDGE_RULES).with_bucket_entry(
        "abuse",
        "2001:db8::7",
        Utc::now() + Duration::hours(1),
    );
    call(&app, publish(&event)).await;
    call(&app, publish(&PolicyEvent::full("bad-name", "deny if { true }"))).await;
    converge(&state).await;

    let req = Request::builder()
        .uri("/_firewall/reputation")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let doc: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["generation"], 1);
    assert!(doc["buckets"]["edge"]["abuse"]["ipv6"]
        .as_object()
        .unwrap()
        .contains_key("2001:db8::7"));

    let req = Request::builder()
        .uri("/_firewall/policies")
        .body(Body::empty())
        .unwrap();
    let (_, body) = call(&app, req).await;
    let doc: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["compiled"], serde_json::json!(["edge"]));
    assert_eq!(doc["skipped"], serde_json::json!(["bad-name"]));
    assert_eq!(doc["policies"][1]["name"], "edge");
}

#[tokio::test]
async fn invalid_events_are_refused_at_ingress() {
    let state = state();
    let app = router::build_router(state.clone());

    let req = Request::builder()
        .method("POST")
        .uri("/_firewall/events")
        .body(Body::from(r#"{"type":"FULL","name":"edge","rego":"  "}"#))
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["code"], "VALIDATION");

    let req = Request::builder()
        .method("POST")
        .uri("/_firewall/events")
        .body(Body::from("not json"))
        .unwrap();
    let (status, _) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let sub = state.channel().subscribe("firewall-policies", "check").await.unwrap();
    assert_eq!(regowall_gateway::channel::backlog(sub.as_ref()).unwrap(), 0);
}

#[tokio::test]
async fn ops_endpoints() {
    let state = state();
    let app = router::build_router(state.clone());
    let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();

    let (status, _) = call(&app, get("/_firewall/healthz")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, get("/_firewall/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    state.mark_ready();
    let (status, _) = call(&app, get("/_firewall/readyz")).await;
    assert_eq!(status, StatusCode::OK);

    // before any compilation everything is allowed
    let (status, _) = call(&app, visit("api.example.com", "1.1.1.1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, get("/_firewall/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("regowall_decisions_total{verdict=\"allow\"} 1"));
    assert!(text.contains("regowall_ready 1"));
}

struct Faulting;

impl PolicyEvaluator for Faulting {
    fn evaluate(&self, _facts: &RequestFacts) -> Result<Vec<ModuleResult>> {
        Err(RegowallError::Evaluation("rule conflict".into()))
    }
}

#[tokio::test]
async fn evaluation_failure_allows_and_is_counted_once() {
    let state = state();
    let app = router::build_router(state.clone());
    let mut snapshot = CompiledSnapshot::empty();
    snapshot.generation = 4;
    snapshot.evaluator = Some(Arc::new(Faulting));
    state.live().store(Arc::new(snapshot));

    let (status, body) = call(&app, visit("api.example.com", "9.9.9.9")).await;
    assert_eq!(status, StatusCode::OK);
    let verdict: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(verdict["allow"], true);
    assert_eq!(verdict["generation"], 4);

    let metrics = state.metrics();
    assert_eq!(metrics.evaluation_errors.get(&[("kind", "EVALUATION")]), 1);
    assert_eq!(metrics.decisions.get(&[("verdict", "allow")]), 1);
}
