#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use regowall_core::PolicyEvent;
use regowall_gateway::app_state::AppState;
use regowall_gateway::channel::{backlog, DistributionChannel, InMemoryBus, Subscription};
use regowall_gateway::consumer;
use regowall_gateway::policy::RegoBackend;
use regowall_gateway::runtime::BackgroundTasks;
use regowall_gateway::{config, scheduler};

const TOPIC: &str = "firewall-policies";

fn state(bus: &InMemoryBus, extra: &str) -> AppState {
    let yaml = format!("version: 1\nchannel: {{ endpoints: [\"memory://local\"] }}\n{extra}");
    let cfg = config::load_from_str(&yaml).unwrap();
    AppState::new(cfg, Arc::new(bus.clone()), Arc::new(RegoBackend::new()))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn bad_events_are_counted_and_committed() {
    let bus = InMemoryBus::new(1, 100);
    let state = state(&bus, "");
    let mut sub = bus.subscribe(TOPIC, "regowall").await.unwrap();

    bus.publish_raw(TOPIC, "junk", Bytes::from_static(b"{\"type\":\"DELETE\"}"))
        .unwrap();
    let orphan = PolicyEvent::patch("ghost").with_data(serde_json::json!({"a": 1}));
    bus.publish(TOPIC, &orphan).await.unwrap();
    bus.publish(TOPIC, &PolicyEvent::full("edge", "deny if { false }"))
        .await
        .unwrap();

    for _ in 0..3 {
        let delivery = sub.next().await.unwrap();
        consumer::handle_delivery(&state, sub.as_mut(), &delivery);
    }

    assert_eq!(backlog(sub.as_ref()).unwrap(), 0);
    assert_eq!(sub.committed(0).unwrap(), Some(3));
    let metrics = state.metrics();
    assert_eq!(
        metrics
            .policy_events
            .get(&[("type", "unknown"), ("outcome", "malformed")]),
        1
    );
    assert_eq!(
        metrics
            .policy_events
            .get(&[("type", "PATCH"), ("outcome", "rejected")]),
        1
    );
    assert_eq!(
        metrics
            .policy_events
            .get(&[("type", "FULL"), ("outcome", "applied")]),
        1
    );
    assert!(state.store().get("ghost").unwrap().is_none());
    assert!(state.store().get("edge").unwrap().is_some());
}

#[tokio::test]
async fn consumer_loop_applies_marks_ready_and_stops() {
    let bus = InMemoryBus::new(2, 100);
    let state = state(&bus, "");
    let sub = bus.subscribe(TOPIC, "regowall").await.unwrap();
    let (stop, signal) = watch::channel(false);
    let task = tokio::spawn(consumer::run(state.clone(), sub, signal));

    // an idle poll is still a completed poll
    let ready = state.clone();
    eventually(move || ready.is_ready()).await;

    bus.publish(TOPIC, &PolicyEvent::full("edge", "deny if { false }"))
        .await
        .unwrap();
    let store = state.store();
    eventually(move || store.get("edge").unwrap().is_some()).await;

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer stops on shutdown")
        .unwrap();
    assert_eq!(state.metrics().consumer_backlog.get(&[]), 0);
}

#[tokio::test]
async fn background_tasks_recompile_after_full() {
    let bus = InMemoryBus::new(2, 100);
    let state = state(&bus, "policies: { compile_interval_ms: 3600000 }\n");
    scheduler::compile_now(&state).await.unwrap();
    let tasks = BackgroundTasks::start(state.clone()).await.unwrap();

    bus.publish(TOPIC, &PolicyEvent::full("edge", "deny if { input.path == \"/admin\" }"))
        .await
        .unwrap();

    // a FULL triggers a prompt rebuild, well before the interval
    let live = state.clone();
    eventually(move || live.live().load().compiled == vec!["edge".to_string()]).await;
    assert!(state.live().load().generation >= 2);
    assert!(state.is_ready());

    tokio::time::timeout(Duration::from_secs(5), tasks.shutdown())
        .await
        .expect("tasks join");
}

#[tokio::test]
async fn producer_publishes_its_full_policy_at_start() {
    let bus = InMemoryBus::new(2, 100);
    let state = state(&bus, "producer: { enabled: true }\n");
    let tasks = BackgroundTasks::start(state.clone()).await.unwrap();

    let store = state.store();
    eventually(move || store.get("nouseragent").unwrap().is_some()).await;
    let live = state.clone();
    eventually(move || {
        live.live()
            .load()
            .compiled
            .iter()
            .any(|name| name == "nouseragent")
    })
    .await;
    assert!(state.live().load().dataset["nouseragent"]["host_prefixes"].is_array());

    tasks.shutdown().await;
}
