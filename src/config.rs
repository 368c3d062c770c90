use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    discovery::ProbeSettings, session::SessionSettings, db::StorePaths,
    transport::SerialSettings,
};

pub const DEFAULT_CONFIG_FILE: &str = "sensor-logger.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub baud_rate: u32,
    pub io_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub response_window_ms: u64,
    pub response_poll_ms: u64,
    pub request_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Only probe ports whose name contains this text.
    pub port_filter: Option<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sensor_data.db"),
            backup_dir: PathBuf::from("."),
            baud_rate: 115_200,
            io_timeout_ms: 2_000,
            settle_delay_ms: 2_000,
            response_window_ms: 3_000,
            response_poll_ms: 100,
            request_interval_ms: 5_000,
            shutdown_grace_ms: 500,
            port_filter: None,
        }
    }
}

impl LoggerConfig {
    /// Missing file means defaults; a file that doesn't parse is logged and
    /// also falls back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Ok(serde_json::from_str(&contents).unwrap_or_else(|err| {
            log::warn!(
                "Ignoring unparsable config {} ({err}); using defaults",
                path.display()
            );
            Self::default()
        }))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths {
            db_path: self.db_path.clone(),
            backup_dir: self.backup_dir.clone(),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            serial: self.serial_settings(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            response_window: Duration::from_millis(self.response_window_ms),
            poll_interval: Duration::from_millis(self.response_poll_ms),
            port_filter: self.port_filter.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            request_interval: Duration::from_millis(self.request_interval_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            listen_timeout: Duration::from_millis(self.response_poll_ms),
        }
    }
}
