//! # till-syncd
//!
//! Headless sync daemon for a point-of-sale terminal.
//!
//! ## Usage
//! ```text
//! till-syncd [CONFIG_PATH]
//! ```
//!
//! Without a path the platform config file is used (see
//! [`SyncConfig::default_config_path`]); `TILL_*` environment variables
//! override individual settings.
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - `RUST_LOG=till_sync=trace` - Trace the sync engine only
//! - Default: `info,till=debug,sqlx=warn`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use till_core::{SyncSnapshot, SyncStatus};
use till_db::Database;
use till_sync::{HttpTransport, SyncAgent, SyncConfig, SyncStateObserver};

/// Logs every sync state transition.
struct LogObserver;

impl SyncStateObserver for LogObserver {
    fn on_state(&self, snapshot: &SyncSnapshot) {
        match snapshot.status {
            SyncStatus::Error => warn!(
                store_id = %snapshot.store_id,
                pending = snapshot.pending_count,
                failed = snapshot.failed_count,
                error = ?snapshot.last_error,
                "Sync state: error"
            ),
            status => info!(
                store_id = %snapshot.store_id,
                pending = snapshot.pending_count,
                failed = snapshot.failed_count,
                ?status,
                "Sync state changed"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting till sync daemon");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("loading sync config")?;
    info!(
        device_id = %config.device.id,
        server = %config.server.base_url,
        stores = ?config.store_ids(),
        "Configuration loaded"
    );

    let db_path = config.database_path();
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let db = Database::new(config.db_config())
        .await
        .context("opening local database")?;
    info!(path = %db_path.display(), "Database connected and migrations applied");

    let transport = HttpTransport::new(config.base_url()?, config.request_timeout())
        .context("building HTTP client")?;

    let handle = SyncAgent::new(config, db.clone(), Arc::new(transport))
        .with_observer(Arc::new(LogObserver))
        .spawn();

    shutdown_signal().await;

    handle.shutdown().await;
    db.close().await;

    info!("Sync daemon stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,till=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received");
}
