//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.gantry/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to sensible
//! defaults when the file is missing or malformed.

use std::path::Path;
use std::time::Duration;

use gantry_core::engine::retry::RetryPolicy;
use gantry_core::engine::worker::WorkerConfig;
use serde::{Deserialize, Serialize};

use crate::sqlite::pool::default_database_url;

// ---------------------------------------------------------------------------
// Config shape
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Maximum jobs in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `[retry]` section. Category attempt budgets keep their built-in
/// defaults; the cap and jitter are the knobs operators actually turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Upper bound on backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the capped delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// `[database]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite database URL. Defaults to the data-directory database.
    #[serde(default)]
    pub url: Option<String>,
}

impl EngineConfig {
    /// Worker configuration for an optional instance binding.
    pub fn worker_config(&self, instance: Option<uuid::Uuid>) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker.concurrency.max(1),
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms.max(1)),
            instance,
        }
    }

    /// Retry policy with the configured cap and jitter applied.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_delay_ms: self.retry.max_delay_ms,
            jitter_factor: self.retry.jitter_factor.clamp(0.0, 1.0),
            ..RetryPolicy::default()
        }
    }

    /// The database URL, falling back to the data-directory default.
    pub fn database_url(&self) -> String {
        self.database
            .url
            .clone()
            .unwrap_or_else(default_database_url)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the
///   default.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config.toml at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
