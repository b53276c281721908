//! Configuration types for PAWS.
//!
//! `PawsConfig` represents the `config.toml` in the data directory. It
//! controls default timeouts and where run event logs are kept.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.paws/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PawsConfig {
    /// Dispatch timeout for steps that do not set `timeout`.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Time limit for a single shell command run by the Bash extension.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,

    /// Event store backend for the run driver.
    #[serde(default)]
    pub event_store: EventStoreKind,

    /// Directory for JSON Lines event logs, relative to the data dir.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// SQLite database file, relative to the data dir.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Export spans through OpenTelemetry.
    #[serde(default)]
    pub otel: bool,

    /// Write log lines to stderr as JSON objects instead of text.
    #[serde(default)]
    pub log_json: bool,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_shell_timeout_secs() -> u64 {
    30
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_database_file() -> String {
    "paws.db".to_string()
}

impl Default for PawsConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            shell_timeout_secs: default_shell_timeout_secs(),
            event_store: EventStoreKind::default(),
            log_dir: default_log_dir(),
            database_file: default_database_file(),
            otel: false,
            log_json: false,
        }
    }
}

/// Which `EventStore` implementation the run driver uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStoreKind {
    /// One JSON object per line, one file per run.
    #[default]
    Jsonl,
    /// One shared SQLite database, rows keyed by run id.
    Sqlite,
}
