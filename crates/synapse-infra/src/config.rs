//! Configuration loader for Synapse.
//!
//! Reads `synapse.toml` and deserializes it into [`SynapseConfig`]. Falls
//! back to defaults (in-memory repository, `runner.default` and
//! `correlator.default` identities) when the file is missing or malformed.

use std::path::{Path, PathBuf};

use synapse_types::config::SynapseConfig;

/// File name looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "synapse.toml";

/// Smallest activity event bus capacity accepted from configuration.
const MIN_EVENT_BUS_CAPACITY: usize = 16;

/// Load configuration from `path`.
///
/// - Missing file: defaults, logged at debug.
/// - Unreadable or unparsable file: defaults, logged as a warning.
pub async fn load_config(path: &Path) -> SynapseConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            return SynapseConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read config, using defaults");
            return SynapseConfig::default();
        }
    };

    match toml::from_str::<SynapseConfig>(&content) {
        Ok(mut config) => {
            config.event_bus.capacity = config.event_bus.capacity.max(MIN_EVENT_BUS_CAPACITY);
            config
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse config, using defaults");
            SynapseConfig::default()
        }
    }
}

/// Config path from `SYNAPSE_CONFIG`, an explicit CLI value, or the default
/// file name, in that order.
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    std::env::var_os("SYNAPSE_CONFIG")
        .map(PathBuf::from)
        .or_else(|| cli.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
