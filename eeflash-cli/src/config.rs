//! Configuration file support for eeflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (EEFLASH_*)
//! 3. Local config file (./eeflash.toml)
//! 4. Global config file (~/.config/eeflash/config.toml)
//!
//! Files found by discovery that fail to parse are reported and skipped. A
//! file named explicitly with `--config` must load.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use directories::ProjectDirs;
use eeflash::protocol::{DEFAULT_BAUD, DEFAULT_TIMEOUT};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::CliError;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "eeflash.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Reply timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Bridge boards remembered for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Transfer behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Dump and compare after every write.
    #[serde(default)]
    pub verify_after_write: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Link settings after CLI, environment and files are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Baud rate.
    pub baud: u32,
    /// Reply timeout.
    pub timeout: Duration,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::discover(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::discover(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Invalid config file {}: {e}", path.display()))
        })?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load a discovered file, warning instead of failing.
    fn discover(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                return None;
            },
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => match config.validate() {
                Ok(()) => Some(config),
                Err(e) => {
                    warn!("Ignoring config file {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to parse config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Reject values no link can use.
    fn validate(&self) -> Result<(), CliError> {
        if self.connection.baud == Some(0) {
            return Err(CliError::Config("baud must be greater than zero".into()));
        }
        if self.connection.timeout_secs == Some(0) {
            return Err(CliError::Config(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "eeflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.timeout_secs.is_some() {
            self.connection.timeout_secs = other.connection.timeout_secs;
        }
        self.connection.usb_device.extend(other.connection.usb_device);

        if other.transfer.verify_after_write {
            self.transfer.verify_after_write = true;
        }
    }

    /// Resolve link settings; `baud` and `timeout_secs` come from the command line.
    pub fn link_settings(&self, baud: Option<u32>, timeout_secs: Option<u64>) -> LinkSettings {
        LinkSettings {
            baud: baud
                .or(self.connection.baud)
                .unwrap_or(DEFAULT_BAUD),
            timeout: timeout_secs
                .or(self.connection.timeout_secs)
                .map_or(DEFAULT_TIMEOUT, Duration::from_secs),
        }
    }

    /// Save a bridge board for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> Result<()> {
        let device = UsbDevice { vid, pid };

        if self.connection.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        // Re-read the target so unrelated keys in it survive.
        let mut on_disk = Self::discover(&path).unwrap_or_default();
        if !on_disk.connection.usb_device.contains(&device) {
            on_disk.connection.usb_device.push(device.clone());
        }
        self.connection.usb_device.push(device);

        let content = toml::to_string_pretty(&on_disk)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
