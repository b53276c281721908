//! Configuration loader for PAWS.
//!
//! Reads `config.toml` from the data directory (`~/.paws/` by default) and
//! deserializes it into [`PawsConfig`]. Falls back to defaults when the file
//! is missing or malformed.

use std::path::{Path, PathBuf};

use paws_types::config::PawsConfig;

/// Directory name under the home directory when no data dir is given.
const DEFAULT_DATA_DIR_NAME: &str = ".paws";

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`PawsConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> PawsConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return PawsConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return PawsConfig::default();
        }
    };

    match toml::from_str::<PawsConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            PawsConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// An explicit directory (the `--data-dir` flag, or `PAWS_DATA_DIR` through
/// clap's env fallback) wins; otherwise `~/.paws`, or `./.paws` when no home
/// directory is known.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DATA_DIR_NAME)
    })
}

/// Directory holding JSON Lines run logs.
pub fn log_dir(data_dir: &Path, config: &PawsConfig) -> PathBuf {
    data_dir.join(&config.log_dir)
}

/// `sqlite://` URL of the run database, created if missing.
pub fn database_url(data_dir: &Path, config: &PawsConfig) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        data_dir.join(&config.database_file).display()
    )
}
