//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize subsystems in dependency order (logging, metrics, store, guard)
//! - Start background tasks (config watcher, admin API)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::admin::setup_admin_router;
use crate::config::loader::{load_config, load_from_env, ConfigError};
use crate::config::watcher::ConfigWatcher;
use crate::config::GuardConfig;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::spawn_signal_handler;
use crate::observability::{logging, metrics};
use crate::security::error::SetupError;
use crate::security::Guard;
use crate::store::{self, StoreError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("security setup: {0}")]
    Setup(#[from] SetupError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics: {0}")]
    Metrics(String),

    #[error("config watcher: {0}")]
    Watcher(#[from] notify::Error),
}

/// Load from `path` when given, otherwise defaults plus environment.
pub fn load(path: Option<&Path>) -> Result<GuardConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => load_from_env(),
    }
}

/// Connect the store and assemble the guard.
pub async fn build_guard(config: GuardConfig) -> Result<Guard, StartupError> {
    let store = store::connect(&config.store).await?;
    tracing::info!(backend = store.backend_name(), "Shared store ready");
    let monitor = Guard::new_monitor(&config, store.clone());
    Ok(Guard::new(config, store, monitor, None)?)
}

/// Run the guard until a termination signal arrives.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let config = load(config_path.as_deref())?;
    logging::init_logging(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "edge-guard starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.url,
        store = ?config.store.backend,
        failure_policy = config.store.failure_policy.as_str(),
        "Configuration loaded"
    );

    let defaults = GuardConfig::default();
    if config.csrf.secret == defaults.csrf.secret {
        tracing::warn!("csrf.secret is the built-in placeholder; set a real secret");
    }
    if config.admin.enabled && config.admin.api_key == defaults.admin.api_key {
        tracing::warn!("admin.api_key is the built-in placeholder; set a real key");
    }

    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|e: std::net::AddrParseError| StartupError::Metrics(e.to_string()))?;
        metrics::init_metrics(addr).map_err(|e| StartupError::Metrics(e.to_string()))?;
        tracing::info!(address = %addr, "Metrics exporter listening");
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let admin = config.admin.clone();
    let server = HttpServer::new(build_guard(config).await?);

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    // The watcher must outlive the server.
    let (_watcher, config_updates) = match config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(&path);
            (Some(watcher.run()?), updates)
        }
        None => {
            let (_tx, updates) = mpsc::unbounded_channel();
            (None, updates)
        }
    };

    if admin.enabled {
        let admin_listener = TcpListener::bind(&admin.bind_address).await?;
        tracing::info!(address = %admin.bind_address, "Admin API listening");
        let router = setup_admin_router(server.guards());
        let mut admin_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    server.run(listener, config_updates, shutdown.subscribe()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
