//! Background task ownership.
//!
//! Every long-running task watches the same shutdown signal; `shutdown`
//! flips it and joins them all.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use regowall_core::{RegowallError, Result};

use crate::app_state::AppState;
use crate::producer::{NoUserAgentProducer, PolicyController, PolicyProducer};
use crate::{consumer, scheduler};

pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Subscribe to the policy topic and start the consumer, the recompile
    /// scheduler and, when enabled, the producer loops.
    pub async fn start(state: AppState) -> Result<Self> {
        let (shutdown, signal) = watch::channel(false);
        let mut handles = Vec::new();

        let cfg = state.cfg();
        let subscription = state
            .channel()
            .subscribe(&cfg.channel.topic, &cfg.channel.group)
            .await?;
        handles.push((
            "consumer",
            tokio::spawn(consumer::run(state.clone(), subscription, signal.clone())),
        ));

        let interval = Duration::from_millis(cfg.policies.compile_interval_ms);
        handles.push((
            "scheduler",
            tokio::spawn(scheduler::run(state.clone(), interval, signal.clone())),
        ));

        if cfg.producer.enabled {
            let producer: Arc<dyn PolicyProducer> =
                Arc::new(NoUserAgentProducer::from_config(&cfg.producer)?);
            let controller = Arc::new(PolicyController::new(
                vec![producer],
                state.channel(),
                cfg.channel.topic.clone(),
                Arc::clone(state.metrics()),
            ));
            // FULL first, so PATCHes from the ingress log find a definition.
            controller.sync_policies(chrono::Utc::now()).await;

            if let Some(path) = &cfg.producer.ingress_log {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    RegowallError::Config(format!("open ingress log {}: {e}", path.display()))
                })?;
                let ingest = Arc::clone(&controller);
                let mut stop = signal.clone();
                handles.push((
                    "ingest",
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = stop.changed() => tracing::info!("ingress log replay interrupted"),
                            drained = ingest.ingest(BufReader::new(file)) => match drained {
                                Ok(published) => tracing::info!(published, "ingress log drained"),
                                Err(e) => tracing::error!(error = %e, "ingress log failed"),
                            },
                        }
                    }),
                ));
            }

            let sync_interval = Duration::from_millis(cfg.producer.sync_interval_ms);
            handles.push((
                "producer-sync",
                tokio::spawn(controller.run_sync_loop(sync_interval, signal.clone())),
            ));
        }

        tracing::info!(tasks = handles.len(), "background tasks started");
        Ok(Self { shutdown, handles })
    }

    pub fn signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                tracing::warn!(task = name, error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("background tasks stopped");
    }
}
