use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{EngineConfig, StoreBackend};
use crate::error::StoreResult;
use crate::session::{HttpSessionFactory, SessionFactory};
use crate::task::{JsonTaskStore, SqliteTaskStore, TaskStore};

pub const DEFAULT_LOG_FILTER: &str = "info,harvest_engine_rs=debug";

/// Trimmed value of `key`, if set and non-empty.
pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_parse<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| format!("invalid {}={:?}: {}", key, raw, err)),
        None => Ok(None),
    }
}

/// Comma-separated values of `primary`, followed by `<prefix>_2` through
/// `<prefix>_10`.
pub fn env_list(primary: &str, prefix: &str) -> Vec<String> {
    let mut items = Vec::new();
    if let Ok(raw) = env::var(primary) {
        for item in raw.split(',') {
            let trimmed = item.trim();
            if !trimmed.is_empty() {
                items.push(trimmed.to_string());
            }
        }
    }
    for idx in 2..=10 {
        let key = format!("{}_{}", prefix, idx);
        if let Ok(value) = env::var(&key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                items.push(trimmed.to_string());
            }
        }
    }
    items
}

pub fn build_task_store(cfg: &EngineConfig) -> StoreResult<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match cfg.store_backend {
        StoreBackend::Sqlite => Arc::new(SqliteTaskStore::open(&cfg.store_path)?),
        StoreBackend::Json => Arc::new(JsonTaskStore::open(&cfg.store_path)?),
        StoreBackend::Memory => Arc::new(JsonTaskStore::in_memory()),
    };
    info!(backend = %cfg.store_backend, path = %cfg.store_path.display(), "task store ready");
    Ok(store)
}

pub fn build_session_factory(cfg: &EngineConfig) -> Arc<dyn SessionFactory> {
    Arc::new(HttpSessionFactory::new(cfg.session_config()))
}

/// Installs the global subscriber: `RUST_LOG` or [`DEFAULT_LOG_FILTER`].
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
