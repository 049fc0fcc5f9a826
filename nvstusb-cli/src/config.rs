// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use anyhow::{Context, Result};
use nvstusb::{
    DeviceIdentity, EmitterOptions, EMITTER_PRODUCT_ID, EMITTER_VENDOR_ID, SETTLE_DELAY,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "nvstusb.yaml";

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceIdentification,
    /// Firmware image extracted from the vendor driver (`nvstusb.fw`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<PathBuf>,
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: f64,
    #[serde(default)]
    pub invert_eyes: bool,
    /// Wait after reset, close and reopen. Values below 250 ms are raised to it.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identification (vendor ID, product ID)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for DeviceIdentification {
    fn default() -> Self {
        Self {
            vendor_id: EMITTER_VENDOR_ID,
            product_id: EMITTER_PRODUCT_ID,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_refresh_rate() -> f64 {
    120.0
}

fn default_settle_delay_ms() -> u64 {
    250
}

fn default_transfer_timeout_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceIdentification::default(),
            firmware_path: None,
            refresh_rate: default_refresh_rate(),
            invert_eyes: false,
            settle_delay_ms: default_settle_delay_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse YAML config")?;
        Ok(config)
    }

    /// Find and load the configuration file.
    ///
    /// An explicit path has to exist. Otherwise searches in order:
    /// 1. Current directory
    /// 2. User's config directory (~/.config/nvstusb/ on Linux)
    ///
    /// If no config file is found, writes a default one to the user's config
    /// directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let user_dir = Self::get_user_config_dir()?;
        let search_paths = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            user_dir.join(CONFIG_FILE_NAME),
        ];
        Self::load_from_paths(&search_paths, &user_dir.join(CONFIG_FILE_NAME))
    }

    /// Load the first existing file of `search_paths`, or create `fallback`
    pub fn load_from_paths(search_paths: &[PathBuf], fallback: &Path) -> Result<Self> {
        if let Some(path) = search_paths.iter().find(|p| p.exists()) {
            return Self::from_file(path);
        }

        if let Some(dir) = fallback.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
            }
        }

        let default_config = Self::default();
        let yaml = serde_yaml::to_string(&default_config)
            .with_context(|| "Failed to serialize default config")?;
        fs::write(fallback, yaml)
            .with_context(|| format!("Failed to write default config to: {:?}", fallback))?;

        Ok(default_config)
    }

    fn get_user_config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to get config directory")?
            .join("nvstusb"))
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.device.vendor_id, self.device.product_id)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Options for the emitter connection manager
    pub fn emitter_options(&self) -> EmitterOptions {
        EmitterOptions {
            identity: self.identity(),
            invert_eyes: self.invert_eyes,
            settle_delay: self.settle_delay(),
        }
    }

    /// Settle delay, never shorter than the emitter needs to re-enumerate
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms).max(SETTLE_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: Config = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.identity(), DeviceIdentity::new(0x0955, 0x0007));
        assert_eq!(config.refresh_rate, 120.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
device:
  vendor_id: 2389
  product_id: 7
firmware_path: /opt/nvstusb/nvstusb.fw
refresh_rate: 100.0
invert_eyes: true
settle_delay_ms: 500
logging:
  level: debug
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config.firmware_path,
            Some(PathBuf::from("/opt/nvstusb/nvstusb.fw"))
        );
        assert_eq!(config.refresh_rate, 100.0);
        assert_eq!(config.transfer_timeout(), Duration::from_secs(1));

        let options = config.emitter_options();
        assert!(options.invert_eyes);
        assert_eq!(options.settle_delay, Duration::from_millis(500));
        assert_eq!(options.identity, DeviceIdentity::new(0x0955, 0x0007));
    }

    #[test]
    fn test_settle_delay_has_lower_bound() {
        let config: Config = serde_yaml::from_str("settle_delay_ms: 0").unwrap();
        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert_eq!(
            config.emitter_options().settle_delay,
            Duration::from_millis(250)
        );

        let config: Config = serde_yaml::from_str("settle_delay_ms: 100").unwrap();
        assert_eq!(config.settle_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("nvstusb").join(CONFIG_FILE_NAME);

        let config =
            Config::load_from_paths(&[dir.path().join(CONFIG_FILE_NAME)], &fallback).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(Config::from_file(&fallback).unwrap(), Config::default());
    }

    #[test]
    fn test_load_prefers_first_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.yaml");
        let second = dir.path().join("second.yaml");
        fs::write(&second, "refresh_rate: 60.0\n").unwrap();

        let config = Config::load_from_paths(&[first, second.clone()], &second).unwrap();

        assert_eq!(config.refresh_rate, 60.0);
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "refresh_rate: [").unwrap();

        assert!(Config::from_file(&path).is_err());
    }
}
