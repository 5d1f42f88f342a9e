//! Engine configuration types.
//!
//! `AcidicConfig` represents the `acidic.toml` file that controls where run
//! records live, how long a lock is honored, and logging defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// All fields have sensible defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcidicConfig {
    /// sqlx database URL for the run store.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Seconds after which a held lock is treated as abandoned by a crashed worker.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub enable_otel: bool,
}

/// Returns the default database URL based on `ACIDIC_DATA_DIR` env var,
/// falling back to `~/.acidic/acidic.db`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("ACIDIC_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.acidic")
    });
    format!("sqlite://{data_dir}/acidic.db")
}

fn default_lock_timeout_secs() -> u64 {
    90
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl AcidicConfig {
    /// Lock staleness threshold as a chrono duration.
    pub fn lock_timeout(&self) -> chrono::Duration {
        let secs = self.lock_timeout_secs.min((i64::MAX / 1000) as u64);
        chrono::Duration::seconds(secs as i64)
    }
}

impl Default for AcidicConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            lock_timeout_secs: default_lock_timeout_secs(),
            log_filter: default_log_filter(),
            enable_otel: false,
        }
    }
}
