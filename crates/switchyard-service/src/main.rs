//! # Switchyard Service
//!
//! Runs a messaging manager as a standalone process.
//!
//! This executable:
//! - Loads configuration from files and the environment
//! - Initializes structured logging
//! - Builds and starts the messaging manager, declaring the configured topology
//! - Logs a health summary periodically
//! - Shuts the manager down on SIGINT or SIGTERM

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::manager::{HealthStatus, MessagingManager, MessagingManagerBuilder};
use switchyard_core::middleware::{LoggingMiddleware, MetricsMiddleware};
use switchyard_core::MessagingConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming an explicit configuration file
const CONFIG_FILE_ENV: &str = "SWITCHYARD_CONFIG_FILE";

/// `json` switches log output to JSON lines
const LOG_FORMAT_ENV: &str = "SWITCHYARD_LOG_FORMAT";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("Starting Switchyard service");

    // -------------------------------------------------------------------------
    // Load configuration
    //
    // Sources, later ones overriding earlier ones:
    //  1. ./config/switchyard.{toml,yaml,json}
    //  2. The file named by SWITCHYARD_CONFIG_FILE, which must exist
    //  3. Environment variables prefixed SWITCHYARD__ (double-underscore separator)
    //     e.g. SWITCHYARD__BACKEND__DLQ_SUFFIX=.dead
    // -------------------------------------------------------------------------
    let explicit_path = std::env::var(CONFIG_FILE_ENV)
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);

    let config = MessagingConfig::load(explicit_path.as_deref())
        .context("messaging configuration is invalid")?;

    info!(
        backend = %config.backend.backend_type,
        rules = config.routing.rules.len(),
        queues = config.topology.queues.len(),
        exchanges = config.topology.exchanges.len(),
        "Configuration loaded"
    );

    let metrics_middleware = Arc::new(MetricsMiddleware::new("metrics"));
    let manager = MessagingManagerBuilder::from_config(&config)
        .context("failed to assemble messaging manager")?
        .with_middleware(Arc::new(LoggingMiddleware::new("log")))
        .with_middleware(metrics_middleware.clone())
        .build()
        .context("failed to build messaging manager")?;

    if let Err(e) = manager.start().await {
        error!(error = %e, "Messaging manager failed to start");
        if let Err(e) = manager.shutdown().await {
            warn!(error = %e, "Cleanup after failed start also failed");
        }
        return Err(e).context("messaging manager failed to start");
    }

    let report_interval = Duration::from_secs(config.manager.health_check_interval_seconds);
    let reporter = tokio::spawn(report_health(manager.clone(), report_interval));

    shutdown_signal().await;
    reporter.abort();

    let timeout = Duration::from_secs(config.manager.shutdown_timeout_seconds);
    info!(timeout_seconds = timeout.as_secs(), "Shutting down messaging manager");

    let stage_metrics = metrics_middleware.snapshot();
    info!(
        samples = stage_metrics.samples,
        average_ms = stage_metrics.average_processing_time.as_millis() as u64,
        max_ms = stage_metrics.max_processing_time.as_millis() as u64,
        "Middleware processing summary"
    );

    match tokio::time::timeout(timeout * 2, manager.shutdown()).await {
        Ok(Ok(())) => {
            info!("Switchyard service stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("messaging manager shutdown failed"),
        Err(_) => anyhow::bail!("messaging manager did not shut down within {:?}", timeout * 2),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchyard_service=info,switchyard_core=info".into());

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Log the manager's health until aborted
async fn report_health(manager: MessagingManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let report = manager.health_check();
        let summary = serde_json::to_string(&report).unwrap_or_default();
        match report.status {
            HealthStatus::Healthy => info!(health = %summary, "Health check"),
            HealthStatus::Degraded | HealthStatus::Unhealthy => {
                warn!(status = %report.status, issues = ?report.issues, health = %summary, "Health check")
            }
        }
    }
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
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
