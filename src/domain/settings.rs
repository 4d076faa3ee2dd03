use crate::domain::models::{ConnectionPriority, Phy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    #[serde(default = "default_true")]
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
            show_file_line: default_true(),
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
    "gatt_central".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Scan Settings
    /// `None` scans until stopped.
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: Option<u64>,

    // Connection Settings
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_preferred_phy")]
    pub preferred_phy: Phy,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,

    // GATT Settings
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub request_highest_mtu: bool,
    #[serde(default = "default_connection_priority")]
    pub connection_priority: ConnectionPriority,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            scan_window_ms: default_scan_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            preferred_phy: default_preferred_phy(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            teardown_grace_ms: default_teardown_grace_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            request_highest_mtu: default_true(),
            connection_priority: default_connection_priority(),
        }
    }
}

fn default_scan_window_ms() -> Option<u64> {
    Some(5000)
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_connect_max_attempts() -> u32 {
    2
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}
fn default_preferred_phy() -> Phy {
    Phy::Le2M
}
fn default_disconnect_timeout_ms() -> u64 {
    2000
}
fn default_teardown_grace_ms() -> u64 {
    500
}
fn default_operation_timeout_ms() -> u64 {
    5000
}
fn default_connection_priority() -> ConnectionPriority {
    ConnectionPriority::High
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path: Some(settings_path),
        })
    }

    /// Settings that are never written to disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GattCentral");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.settings_path {
            let json = serde_json::to_string_pretty(&self.settings)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
