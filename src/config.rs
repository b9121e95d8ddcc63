//! # Configuration Management Module
//!
//! Persistent logger settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `store_data`: Write per-device CSV logs while connected
//! - `ntp_host` / `ntp_timeout_ms`: Server and timeout for the one-shot clock sync
//! - `storage_root`: Override of the directory that receives `HRV/`
//! - `devices`: Addresses to connect to at start-up
//! - `auto_enable_heart_rate`: Enable heart-rate notifications once services are discovered
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/hrv-logger/config.toml
//! - Linux: ~/.config/hrv-logger/config.toml
//! - Windows: %APPDATA%\hrv-logger\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_NTP_HOST: &str = "dk.pool.ntp.org";
pub const DEFAULT_NTP_TIMEOUT_MS: u32 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_data: bool,
    pub ntp_host: String,
    pub ntp_timeout_ms: u32,
    pub storage_root: Option<PathBuf>,
    pub devices: Vec<String>,
    pub auto_enable_heart_rate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_data: true,
            ntp_host: DEFAULT_NTP_HOST.to_string(),
            ntp_timeout_ms: DEFAULT_NTP_TIMEOUT_MS,
            storage_root: None,
            devices: Vec::new(),
            auto_enable_heart_rate: true,
        }
    }
}

impl Config {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hrv-logger")
            .join("config.toml")
    }

    /// Directory under which `HRV/` is created.
    ///
    /// Falls back from the configured override to the documents directory,
    /// then the home directory, then the working directory.
    pub fn storage_root(&self) -> PathBuf {
        self.storage_root
            .clone()
            .or_else(dirs::document_dir)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save()?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(&path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}
