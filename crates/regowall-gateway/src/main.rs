//! regowall enforcement service.
//!
//! - Decision fallback on every path outside `/_firewall/`
//! - Policy events consumed from the channel, recompiled on change
//! - Optional no-user-agent producer publishing blocks

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use regowall_core::{RegowallError, Result};
use regowall_gateway::{
    app_state::AppState, bootstrap, channel::InMemoryBus, config, policy::RegoBackend, router,
    runtime::BackgroundTasks, scheduler,
};

const CONFIG_ENV: &str = "REGOWALL_CONFIG";
const DEFAULT_CONFIG: &str = "regowall.yaml";

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        tracing::error!(code = e.kind().as_str(), error = %e, "regowall-gateway failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let cfg = config::load_from_file(&path)?;
    let listen = cfg.gateway.listen_addr()?;

    tracing::info!(
        endpoints = ?cfg.channel.endpoints,
        security_protocol = cfg.channel.security_protocol.as_str(),
        sasl_mechanism = ?cfg.channel.sasl_mechanism,
        authenticated = cfg.channel.credentials.is_some(),
        topic = %cfg.channel.topic,
        group = %cfg.channel.group,
        "policy channel configured"
    );
    let bus = InMemoryBus::new(cfg.channel.partitions, cfg.channel.retention);
    let state = AppState::new(cfg, Arc::new(bus), Arc::new(RegoBackend::new()));

    if let Some(dir) = &state.cfg().policies.static_dir {
        let events = bootstrap::load_static_policies(dir)?;
        let applied = bootstrap::apply_static(&state.store(), &events, chrono::Utc::now());
        tracing::info!(applied, "static policies applied");
    }
    if let Err(e) = scheduler::compile_now(&state).await {
        tracing::warn!(error = %e, "initial compilation failed, serving allow-all until the next cycle");
    }

    let tasks = BackgroundTasks::start(state.clone()).await?;
    let mut stop = tasks.signal();

    let app = router::build_router(state);
    tracing::info!(%listen, "regowall-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| RegowallError::Config(format!("bind {listen}: {e}")))?;

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
            _ = stop.changed() => {}
        }
    })
    .await;

    tasks.shutdown().await;
    served.map_err(|e| RegowallError::Internal(format!("server failed: {e}")))
}
