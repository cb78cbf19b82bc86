//! gantry daemon: hosts the built-in pipelines behind a worker registry.

mod activity;
mod config;
mod pipelines;
mod triggers;

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_core::{defaults, ErrorSink, EventBus, TracingErrorSink};
use gantry_db::{FilesystemBackend, PersistenceConfig, PersistenceStore};
use gantry_jobs::{RegistryConfig, WorkerRegistry};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "gantry=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gantry=info".into());

    let subscriber = tracing_subscriber::registry().with(env_filter);

    // Optionally write to a daily-rotated file instead of stdout
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("gantry.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            subscriber.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            subscriber
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            subscriber.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let daemon = DaemonConfig::from_env();
    let sink: Arc<dyn ErrorSink> = Arc::new(TracingErrorSink);

    // Durable storage
    let backend = FilesystemBackend::new(daemon.data_dir.clone());
    if let Err(e) = backend.validate().await {
        // Not fatal: the store degrades and keeps running in memory.
        error!(data_dir = %daemon.data_dir.display(), error = %e, "Data directory failed validation");
    }
    let store = PersistenceStore::open(Arc::new(backend), PersistenceConfig::from_env(), sink.clone())
        .await
        .context("failed to open job store")?;

    // Registry and pipelines
    let registry = WorkerRegistry::new(
        RegistryConfig::from_env(),
        store.clone(),
        EventBus::new(defaults::EVENT_BUS_CAPACITY),
        sink,
    );
    activity::attach(&registry);
    for registration in pipelines::registrations(&daemon, &store) {
        registry
            .register(registration)
            .context("failed to register built-in pipeline")?;
    }
    info!(
        data_dir = %daemon.data_dir.display(),
        pipelines = ?registry.pipelines(),
        "Worker registry ready"
    );

    // Triggers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let triggers = vec![
        triggers::spawn_interval_trigger(
            registry.clone(),
            pipelines::HEALTH_CHECK,
            daemon.health_interval,
            json!({}),
            shutdown_rx.clone(),
        ),
        triggers::spawn_interval_trigger(
            registry.clone(),
            pipelines::SCRATCH_CLEANUP,
            daemon.cleanup_interval,
            json!({ "max_age_secs": daemon.scratch_max_age.as_secs() }),
            shutdown_rx,
        ),
    ];

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    for trigger in triggers {
        let _ = trigger.await;
    }
    registry.shutdown().await;

    let health = registry.get_health();
    info!(
        degraded = health.degraded,
        queued_write_count = health.queued_write_count,
        "gantry daemon stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
