use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::events::EventStreamSettings;
use crate::config::Config;
use crate::job::{JobRegistry, Watchdog};
use crate::pipeline::{JobRunner, PipelineSettings, Providers};
use crate::store::JobStore;

/// Build the application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Wire the registry, runner and watchdog from `config`.
pub fn build_state(config: &Config) -> SharedState {
    let toml = &config.toml;
    let registry = JobRegistry::new(JobStore::default(), toml.stages.clone());
    let runner = JobRunner::new(
        registry,
        Providers::from_config(toml),
        PipelineSettings::from_config(toml),
    );
    Arc::new(AppState::new(
        runner,
        EventStreamSettings {
            lookup_window: config.lookup_window(),
            lookup_interval: config.lookup_interval(),
            keepalive: config.keepalive(),
        },
    ))
}

/// Start the job gateway and block until Ctrl+C.
pub async fn start_server(config: &Config) -> Result<()> {
    let work_dir = &config.toml.paths.work_dir;
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

    let state = build_state(config);
    let registry = state.runner.registry().clone();
    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(registry.clone(), config.watchdog_interval())
        .with_retention(config.retention())
        .spawn(shutdown.clone());

    let app = build_router(state, config.toml.server.dev_mode);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, work_dir = %work_dir.display(), "Reelsmith gateway listening");
    println!("Reelsmith running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    let running = registry.running();
    if !running.is_empty() {
        warn!(count = running.len(), "Canceling running jobs on shutdown");
    }
    for job in running {
        let _ = registry.cancel(job.id).await;
    }
    let _ = watchdog.await;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
