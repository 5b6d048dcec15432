//! Recompilation scheduling.
//!
//! One task owns compilation: it wakes on a fixed interval or on request.
//! Requests made while a compilation runs leave a single stored permit, so
//! any number of them collapse into one follow-up that reads the newest
//! store contents.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use regowall_core::{RegowallError, Result};

use crate::app_state::AppState;

#[derive(Clone, Default)]
pub struct RecompileHandle {
    notify: Arc<Notify>,
}

impl RecompileHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.notify.notify_one();
    }

    async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// Purge expired entries, compile off the async runtime, swap the result in.
/// On failure the previous snapshot stays live. Returns the live generation.
pub async fn compile_now(state: &AppState) -> Result<u64> {
    let now = Utc::now();
    let store = state.store();
    let purged = store.purge_expired(now)?;
    let definitions = store.definitions()?;

    let compiler = state.compiler();
    let outcome = tokio::task::spawn_blocking(move || compiler.compile(&definitions, now))
        .await
        .map_err(|e| RegowallError::Internal(format!("compile task failed: {e}")))?;

    let metrics = state.metrics();
    match outcome {
        Ok(snapshot) => {
            let generation = snapshot.generation;
            metrics.compilations.inc(&[("outcome", "ok")]);
            metrics
                .policies_compiled
                .set(&[], snapshot.compiled.len() as i64);
            metrics
                .policies_skipped
                .set(&[], snapshot.skipped.len() as i64);
            metrics
                .reputation_entries
                .set(&[], snapshot.reputation.len() as i64);
            metrics.snapshot_generation.set(&[], generation as i64);
            state.live().store(Arc::new(snapshot));
            if purged > 0 {
                tracing::debug!(purged, generation, "expired bucket entries purged");
            }
            Ok(generation)
        }
        Err(e) => {
            metrics.compilations.inc(&[("outcome", "failed")]);
            let kept = state.live().load().generation;
            tracing::error!(error = %e, kept_generation = kept, "compilation failed, keeping previous snapshot");
            Err(e)
        }
    }
}

pub async fn run(state: AppState, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already compiled once.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = state.recompile().requested() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        // Failures are logged inside; the next tick retries.
        let _ = compile_now(&state).await;
    }
    tracing::info!("recompile scheduler stopped");
}
