use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use assist_runtime::api;
use assist_runtime::config::AppConfig;
use assist_runtime::dispatch::Dispatcher;
use assist_runtime::operations;
use assist_runtime::resilience::{BreakerRegistry, ErrorLedger};
use assist_runtime::session::{SessionRegistry, spawn_idle_reaper};
use assist_runtime::worker::TaskRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        port = config.port,
        max_workers = config.runtime.max_workers,
        breaker_threshold = config.isolator.failure_threshold,
        retry_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    // ── Runtime + delivery ──────────────────────────────────────────────
    let runtime = TaskRuntime::start(config.runtime.clone());
    let sessions = Arc::new(SessionRegistry::new(config.session.clone()));
    runtime.set_notifier(sessions.clone());

    let reaper = spawn_idle_reaper(
        Arc::clone(&sessions),
        config.session.reap_interval,
        config.session.idle_timeout,
    );

    // ── Operations ──────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        runtime.clone(),
        Arc::new(BreakerRegistry::new(config.isolator.clone())),
        Arc::new(ErrorLedger::new()),
        config.retry,
    ));
    operations::register_builtin(&dispatcher).await;

    // ── HTTP / WebSocket ────────────────────────────────────────────────
    let app = api::router(Arc::clone(&dispatcher), Arc::clone(&sessions));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await
    .context("Server error")?;

    reaper.abort();
    runtime.shutdown(true).await;
    tracing::info!("Shut down cleanly");
    Ok(())
}
