//! Daemon Configuration
//!
//! Configuration management for the gnss-link command line front end.

use anyhow::{Context, Result};
use gnss_link_protocol::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Session engine timing and policy
    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage paths
    pub paths: PathConfig,

    /// Transfer defaults
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Storage paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (bond list)
    pub data_dir: PathBuf,
}

/// Transfer defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Where downloads land when the local path is relative
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("gnss-link")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("gnss-link");

        Self {
            engine: EngineConfig::default(),
            paths: PathConfig {
                config_dir: default_config_dir(),
                data_dir,
            },
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_dir().join("daemon.toml"))
    }

    /// Load configuration from `path`, writing defaults there if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config
            .engine
            .validate()
            .context("Invalid [engine] configuration")?;
        Ok(config)
    }

    /// Save configuration to the configured directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.config_path())
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.paths.config_dir.join("daemon.toml")
    }

    /// Bond list used by the JSON bond store
    pub fn bond_store_path(&self) -> PathBuf {
        self.paths.data_dir.join("bonds.json")
    }

    /// Resolve a download destination against the download directory
    pub fn download_path(&self, local: &Path) -> PathBuf {
        if local.is_absolute() {
            local.to_path_buf()
        } else {
            self.transfer.download_dir.join(local)
        }
    }
}
