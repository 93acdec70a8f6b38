//! Shared setup helpers for the CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use turnstate_store::{MemoryStorage, SqliteStorage, Storage};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`. Logs go to stderr so stdout carries
/// only bot replies.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Open the SQLite database at `path`, creating parent directories.
pub async fn open_sqlite(path: &Path) -> Result<SqliteStorage> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let storage = SqliteStorage::open(path)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    info!(path = %path.display(), "sqlite storage ready");
    Ok(storage)
}

/// SQLite storage when a path is given, otherwise process-local memory.
pub async fn open_storage(path: Option<&Path>) -> Result<Arc<dyn Storage>> {
    match path {
        Some(path) => Ok(Arc::new(open_sqlite(path).await?)),
        None => {
            info!("no database configured; state lives in memory for this run");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}
