//! Configuration loading utilities.

use std::path::Path;

use tokio::fs;

use super::{AgentConfig, resolve_config_relative_path};
use crate::error::ConfigError;

/// Reads and parses the agent config from a TOML file.
///
/// A relative `systemd.unit-dir` is resolved against the file's directory.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub async fn load<P: AsRef<Path>>(path: P) -> Result<AgentConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut config: AgentConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.systemd.unit_dir = resolve_config_relative_path(path, &config.systemd.unit_dir);
    Ok(config)
}
