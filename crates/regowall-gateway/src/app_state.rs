//! Shared application state for the firewall.
//!
//! Cheap to clone; everything lives behind one `Arc`.

use std::sync::Arc;

use crate::channel::DistributionChannel;
use crate::config::GatewayConfig;
use crate::obs::metrics::FirewallMetrics;
use crate::policy::{Compiler, DecisionEngine, LiveSnapshot, PolicyBackend, PolicyStore};
use crate::scheduler::RecompileHandle;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: GatewayConfig,
    store: Arc<PolicyStore>,
    compiler: Arc<Compiler>,
    live: Arc<LiveSnapshot>,
    decisions: DecisionEngine,
    channel: Arc<dyn DistributionChannel>,
    recompile: RecompileHandle,
    metrics: Arc<FirewallMetrics>,
}

impl AppState {
    pub fn new(
        cfg: GatewayConfig,
        channel: Arc<dyn DistributionChannel>,
        backend: Arc<dyn PolicyBackend>,
    ) -> Self {
        let live = Arc::new(LiveSnapshot::new());
        let metrics = Arc::new(FirewallMetrics::default());
        Self {
            inner: Arc::new(AppStateInner {
                cfg,
                store: Arc::new(PolicyStore::new()),
                compiler: Arc::new(Compiler::new(backend)),
                decisions: DecisionEngine::new(Arc::clone(&live), Arc::clone(&metrics)),
                live,
                channel,
                recompile: RecompileHandle::new(),
                metrics,
            }),
        }
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    pub fn store(&self) -> Arc<PolicyStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn compiler(&self) -> Arc<Compiler> {
        Arc::clone(&self.inner.compiler)
    }

    pub fn live(&self) -> &LiveSnapshot {
        &self.inner.live
    }

    pub fn decisions(&self) -> &DecisionEngine {
        &self.inner.decisions
    }

    pub fn channel(&self) -> Arc<dyn DistributionChannel> {
        Arc::clone(&self.inner.channel)
    }

    pub fn recompile(&self) -> &RecompileHandle {
        &self.inner.recompile
    }

    pub fn metrics(&self) -> &Arc<FirewallMetrics> {
        &self.inner.metrics
    }

    /// Ready once the policy consumer finished its first poll.
    pub fn is_ready(&self) -> bool {
        self.inner.metrics.is_ready()
    }

    pub fn mark_ready(&self) {
        if !self.is_ready() {
            tracing::info!("policy consumer caught up, ready");
            self.inner.metrics.set_ready();
        }
    }
}
