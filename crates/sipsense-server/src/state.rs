//! Application state shared across handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use sipsense_core::{Config, FileStore, Orchestrator, Radio, Storage};
use tokio::sync::RwLock;
use tracing::info;

/// State behind the router.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// The engine. Handlers clone the `Arc` and release the lock before awaiting it.
    pub orchestrator: Arc<Orchestrator>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Shared handle passed to every handler.
pub type SharedState = Arc<RwLock<AppState>>;

impl AppState {
    /// Wrap an already started orchestrator.
    #[must_use]
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator: Arc::new(orchestrator),
            started_at: Instant::now(),
        }
    }

    /// Start the engine on `radio` with file storage under the configured data dir.
    #[must_use]
    pub fn start(config: Config, radio: Arc<dyn Radio>) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(FileStore::new(&config.storage.data_dir));
        info!(data_dir = %config.storage.data_dir.display(), "Using file storage");
        let orchestrator = Orchestrator::start(radio, storage, &config);
        Self::new(config, orchestrator)
    }

    /// Move into a [`SharedState`].
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }
}

/// Write the default configuration to `path` when no file exists yet.
///
/// Returns `true` if a file was written.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    Config::default()
        .save(path)
        .with_context(|| format!("writing default configuration to {}", path.display()))?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(true)
}

/// The radio selected at build time.
///
/// # Errors
///
/// Returns an error if the Bluetooth stack cannot be opened.
#[cfg(feature = "bluetooth")]
pub async fn build_radio(config: &Config) -> anyhow::Result<Arc<dyn Radio>> {
    let radio = sipsense_core::BluerRadio::new(config.device.clone()).await?;
    Ok(Arc::new(radio))
}

/// The radio selected at build time.
///
/// # Errors
///
/// Never fails with the mock radio.
#[cfg(all(not(feature = "bluetooth"), feature = "mock-bluetooth"))]
pub async fn build_radio(_config: &Config) -> anyhow::Result<Arc<dyn Radio>> {
    tracing::warn!("Built without the `bluetooth` feature, using the mock radio");
    Ok(Arc::new(sipsense_core::MockRadio::new()))
}

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
compile_error!("enable the `bluetooth` or `mock-bluetooth` feature");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sipsense").join("config.toml");

        assert!(ensure_config_file(&path).unwrap());
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();
        assert!(!ensure_config_file(&path).unwrap());
        assert_eq!(Config::load(&path).unwrap().server.port, 8080);
    }
}
