pub mod composite;
pub mod connector;
pub mod db;
pub mod errors;
pub mod formula;
pub mod goals;
pub mod ingest;
pub mod mapping;
pub mod models;
pub mod policy;
pub mod redaction;
pub mod repository;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod transform;

pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult};
pub use crate::repository::Repository;
pub use crate::runner::MetricsRunner;
pub use crate::session::SessionContext;
pub use crate::settings::AppSettings;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file logger. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(log_dir: &Path, default_filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "practice-metrics.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
