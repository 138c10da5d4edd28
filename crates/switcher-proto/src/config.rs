use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
}

/// Observer socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// A single snapshot write taking longer than this drops the observer.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Process whose log lines carry the playback format.
    #[serde(default = "default_process")]
    pub process: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single log fetch; a slower fetch counts as failed.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "platform::default_log_command")]
    pub log_command: Vec<String>,
    /// Group membership needed to read the log store.  `None` skips the check.
    #[serde(default = "platform::default_required_group")]
    pub required_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// How often the device list is re-enumerated to detect changes.
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "platform::default_rate_command")]
    pub rate_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// Initial auto-switch value when no preference has been saved yet.
    #[serde(default = "default_auto_switch")]
    pub auto_switch: bool,
    #[serde(default = "default_preferences_file")]
    pub file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            process: default_process(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            log_command: platform::default_log_command(),
            required_group: platform::default_required_group(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: default_watch_interval_ms(),
            rate_command: platform::default_rate_command(),
        }
    }
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            auto_switch: default_auto_switch(),
            file: default_preferences_file(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_write_timeout_ms() -> u64 {
    2000
}

fn default_process() -> String {
    "Music".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_watch_interval_ms() -> u64 {
    1000
}

fn default_auto_switch() -> bool {
    true
}

fn default_preferences_file() -> PathBuf {
    platform::data_dir().join("preferences.json")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            detection: DetectionConfig::default(),
            devices: DevicesConfig::default(),
            preferences: PreferencesConfig::default(),
        }
    }
}
