use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::connection::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "smart_matic".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Bluetooth address of the dispenser
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_name")]
    pub name: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Session timing
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_disconnect_delay_secs")]
    pub disconnect_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: default_name(),
            log_settings: LogSettings::default(),
            settle_delay_ms: default_settle_delay_ms(),
            status_timeout_secs: default_status_timeout_secs(),
            disconnect_delay_secs: default_disconnect_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_name() -> String {
    "Smart Matic".to_string()
}
fn default_settle_delay_ms() -> u64 {
    2000
}
fn default_status_timeout_secs() -> u64 {
    30
}
fn default_disconnect_delay_secs() -> u64 {
    15
}
fn default_poll_interval_secs() -> u64 {
    60
}

impl Settings {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.address.clone(), self.name.clone())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            status_timeout: Duration::from_secs(self.status_timeout_secs),
            disconnect_delay: Duration::from_secs(self.disconnect_delay_secs),
            ..SessionConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Read-only access to the settings file
pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from `path`, falling back to defaults when it is missing or invalid
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {:#}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SmartMatic");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
