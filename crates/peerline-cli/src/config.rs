//! Chat client configuration, loaded from `~/.peerline/config.toml`.

use peerline_wire::HostConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Listener and dial settings.
    pub network: HostConfig,
    pub identity: IdentityConfig,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            network: HostConfig::default(),
            identity: IdentityConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Derive the node key from the listen port instead of the OS RNG.
    pub deterministic: bool,
}

/// `~/.peerline`, or `./.peerline` without a home directory.
pub fn peerline_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerline")
}

pub fn default_config_path() -> PathBuf {
    peerline_home().join("config.toml")
}

/// Load the config from `path` (or the default location). Any problem with
/// the file is logged and defaults are used instead.
pub fn load_config(path: Option<&Path>) -> ChatConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return ChatConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ChatConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                ChatConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            ChatConfig::default()
        }
    }
}
