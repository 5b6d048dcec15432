//! Policy event consumption loop.
//!
//! Applies each delivered event to the store, asks for a prompt recompile
//! after a FULL, then commits. Commit happens after apply, so a crash in
//! between replays the event (at-least-once; applying twice converges).
//! Bad events are logged, counted and committed so they cannot wedge the
//! partition.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use regowall_core::PolicyEvent;

use crate::app_state::AppState;
use crate::channel::{self, Delivery, Subscription};

/// A poll that sees nothing for this long still counts as completed.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub async fn run(
    state: AppState,
    mut subscription: Box<dyn Subscription>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = tokio::time::timeout(POLL_TIMEOUT, subscription.next()) => polled,
        };

        match polled {
            Err(_elapsed) => {}
            Ok(Ok(delivery)) => handle_delivery(&state, subscription.as_mut(), &delivery),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "policy channel poll failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }

        refresh_backlog(&state, subscription.as_ref());
        state.mark_ready();
    }
    tracing::info!("policy consumer stopped");
}

/// Decode, validate, apply and commit one delivery.
pub fn handle_delivery(state: &AppState, subscription: &mut dyn Subscription, delivery: &Delivery) {
    let metrics = state.metrics();
    match PolicyEvent::from_json(&delivery.payload) {
        Err(e) => {
            metrics
                .policy_events
                .inc(&[("type", "unknown"), ("outcome", "malformed")]);
            tracing::warn!(
                key = %delivery.key,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "dropping undecodable policy event"
            );
        }
        Ok(event) => match state.store().apply(&event, Utc::now()) {
            Ok(applied) => {
                metrics
                    .policy_events
                    .inc(&[("type", event.kind.as_str()), ("outcome", "applied")]);
                if applied.needs_recompile() {
                    state.recompile().request();
                }
            }
            Err(e) => {
                metrics
                    .policy_events
                    .inc(&[("type", event.kind.as_str()), ("outcome", "rejected")]);
                tracing::warn!(
                    policy = %event.name,
                    kind = event.kind.as_str(),
                    error_kind = e.kind().as_str(),
                    error = %e,
                    "policy event rejected"
                );
            }
        },
    }

    if let Err(e) = subscription.commit(delivery) {
        tracing::warn!(partition = delivery.partition, offset = delivery.offset, error = %e, "commit failed");
    }
}

fn refresh_backlog(state: &AppState, subscription: &dyn Subscription) {
    match channel::backlog(subscription) {
        Ok(backlog) => {
            state
                .metrics()
                .consumer_backlog
                .set(&[], i64::try_from(backlog).unwrap_or(i64::MAX));
            tracing::trace!(backlog, "consumer backlog");
        }
        Err(e) => tracing::debug!(error = %e, "backlog unavailable"),
    }
}
