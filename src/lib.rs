pub mod commands;
pub mod db;
pub mod errors;
pub mod fixer;
pub mod gateways;
pub mod models;
pub mod policy;
pub mod rebuilder;
pub mod reconciler;
pub mod scheduler;
pub mod service;

use crate::commands::AppState;
use crate::gateways::CacheGateway;
use crate::service::{ReconcileCore, ServiceOptions};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Boots the reconciliation service: logging, state database, background scheduler.
/// Must be called from within a tokio runtime.
pub fn start(
    data_dir: PathBuf,
    cache: Arc<dyn CacheGateway>,
    options: ServiceOptions,
) -> anyhow::Result<AppState> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    init_tracing(&data_dir).context("failed to initialise logging")?;

    let core = ReconcileCore::new(data_dir.clone(), cache, options)
        .with_context(|| format!("failed to open reconcile state in {}", data_dir.display()))?;
    core.start_scheduler();

    let status = core.get_status().context("failed to read scheduler status")?;
    tracing::info!(
        data_dir = %data_dir.display(),
        enabled = status.enabled,
        interval_hours = status.interval_hours,
        last_run = ?status.last_run,
        "cost reconcile service started"
    );

    Ok(AppState { core })
}

fn init_tracing(data_dir: &Path) -> anyhow::Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "reconcile.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        // already initialised by an earlier start in this process
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error.to_string()))
}
