use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{DeviceBinding, DeviceSelector, DEFAULT_POLL_INTERVAL, MAX_LATENCY};

/// Returns the path to the settings file: `~/.config/soundboard/settings.json`
pub fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("soundboard");
    path.push("settings.json");
    path
}

/// Persisted application settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // Devices
    pub input_device: DeviceSelector,
    pub output_device: DeviceSelector,
    pub channels: u16,

    // Pipeline timing
    pub poll_interval_ms: u64,
    pub latency_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            input_device: DeviceSelector::Default,
            output_device: DeviceSelector::Default,
            channels: 1,

            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            latency_ms: 20,
        }
    }
}

impl AppSettings {
    /// Load settings from the default location, writing defaults on first run.
    pub fn load() -> Self {
        let path = settings_path();
        let exists = path.exists();
        let settings = Self::load_from(&path);
        if !exists {
            settings.save_to(&path);
        }
        settings
    }

    /// Load settings from `path`, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to `path` as pretty JSON.
    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Failed to write settings: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }

    pub fn binding(&self) -> DeviceBinding {
        DeviceBinding::new(
            self.input_device.clone(),
            self.output_device.clone(),
            self.channels,
        )
    }

    /// Never below 1 ms so the wait loop can't spin
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Clamped to the longest prefill the audio bridge accepts
    pub fn latency(&self) -> Duration {
        let latency = Duration::from_millis(self.latency_ms);
        if latency > MAX_LATENCY {
            log::warn!(
                "latency_ms {} too large, using {} ms",
                self.latency_ms,
                MAX_LATENCY.as_millis()
            );
            return MAX_LATENCY;
        }
        latency
    }
}
