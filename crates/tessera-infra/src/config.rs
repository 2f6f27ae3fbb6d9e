//! Engine configuration and data directory resolution.
//!
//! Reads `config.toml` from the data directory (`~/.tessera/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use tessera_types::config::EngineConfig;

/// Resolve the data directory.
///
/// Priority:
/// 1. `TESSERA_DATA_DIR` environment variable
/// 2. `~/.tessera`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TESSERA_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".tessera");
    }
    PathBuf::from(".tessera")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Zero attempts, batch size or poll interval would stall the engine.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    config.transaction_max_attempts = config.transaction_max_attempts.max(1);
    config.delayed_call_batch_size = config.delayed_call_batch_size.max(1);
    config.poll_interval_ms = config.poll_interval_ms.max(10);
    config
}
