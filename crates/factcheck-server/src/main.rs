//! factcheck-server: standalone REST server for the audit engine.
//!
//! Reads config from env vars:
//!   FACTCHECK_CONFIG    : YAML engine config (optional, defaults built in)
//!   FACTCHECK_BIND_ADDR : listen address (default: 0.0.0.0:4200)

use std::sync::Arc;

use anyhow::Context;
use factcheck_core::{AuditEngine, EngineConfig, Scheduler};
use factcheck_server::router::build_router;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,factcheck_core=debug,factcheck_server=debug".into()),
        )
        .init();

    let config = match std::env::var("FACTCHECK_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading engine config from {path}");
            EngineConfig::from_file(&path)?
        }
        Err(_) => EngineConfig::default(),
    };
    let bind_addr =
        std::env::var("FACTCHECK_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4200".into());

    let engine = Arc::new(AuditEngine::new(config).context("invalid engine config")?);

    // Background ticking: resequencer flush, sentiment finalization, claim retries
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(Arc::clone(&engine));
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    let app = build_router(engine);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    tracing::info!("factcheck-server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    scheduler_handle.await.context("scheduler task panicked")?;
    Ok(())
}
