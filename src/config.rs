// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving link settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::{BackendKind, SimulatedDevice};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link settings.
    pub link: LinkConfig,

    /// Devices served by the simulated backend.
    pub simulated: SimulatedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Backend: "auto", "bluez", "simulated", or "unsupported".
    pub backend: BackendKind,

    /// Give up on a connect after this many milliseconds.
    pub connect_timeout_ms: u64,

    /// Length of a discovery scan in milliseconds.
    pub discovery_window_ms: u64,

    /// Inbound line delimiter.
    pub line_delimiter: String,

    /// Longest accepted inbound line, excluding the delimiter.
    pub max_line_length: usize,

    /// RFCOMM channel of the remote serial port service.
    pub rfcomm_channel: u8,

    /// Address to connect to on startup. Empty disables auto-connect.
    pub auto_connect: String,

    /// PIN used when auto-connecting to an unbonded device.
    pub auto_connect_pin: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            connect_timeout_ms: 15_000,
            discovery_window_ms: 12_000,
            line_delimiter: "\n".to_string(),
            max_line_length: 4096,
            rfcomm_channel: 1,
            auto_connect: String::new(),
            auto_connect_pin: String::new(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub devices: Vec<SimulatedDevice>,

    /// Delay before each device shows up in a scan.
    pub scan_delay_ms: u64,

    pub permission_granted: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                SimulatedDevice::new("Pico A", "AA:BB:CC:01"),
                SimulatedDevice::new("Pico B", "AA:BB:CC:02"),
            ],
            scan_delay_ms: 250,
            permission_granted: true,
        }
    }
}

impl Config {
    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluelink")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
