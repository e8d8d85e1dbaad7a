use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub default_port: u16,
    pub connection_timeout_secs: u64,
    pub status_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            default_port: 5555,
            // Headsets answer noticeably slower than phones.
            connection_timeout_secs: 15,
            status_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { max_workers: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub status_fetch_interval_secs: u64,
    pub result_max_age_secs: u64,
    pub result_retention_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub battery_low_threshold: u8,
    pub temperature_high_threshold: f32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            status_fetch_interval_secs: 10,
            result_max_age_secs: 30,
            result_retention_secs: 60,
            shutdown_timeout_secs: 5,
            battery_low_threshold: 20,
            temperature_high_threshold: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PingTargets {
    pub all_devices: bool,
    pub only_not_connected: bool,
    pub only_wifi_devices: bool,
}

impl Default for PingTargets {
    fn default() -> Self {
        Self {
            all_devices: false,
            only_not_connected: true,
            only_wifi_devices: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub enabled: bool,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    #[serde(default)]
    pub ping_targets: PingTargets,
    pub auto_connect: bool,
    pub auto_connect_max_retries: u32,
    pub auto_connect_cooldown_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_secs: 10,
            ping_timeout_secs: 2,
            ping_targets: PingTargets::default(),
            auto_connect: true,
            auto_connect_max_retries: 3,
            auto_connect_cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScrcpySettings {
    pub command_path: String,
    pub bitrate: String,
    pub max_size: u32,
    pub max_fps: u32,
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    pub window_x: Option<i32>,
    pub window_y: Option<i32>,
    pub stay_awake: bool,
    pub show_touches: bool,
    pub fullscreen: bool,
    pub always_on_top: bool,
    pub turn_screen_off: bool,
    // Forwarding audio mutes the headset itself, so it stays off unless asked for.
    pub enable_audio: bool,
    pub render_driver: Option<String>,
}

impl Default for ScrcpySettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            bitrate: "8M".to_string(),
            max_size: 1024,
            max_fps: 60,
            window_width: None,
            window_height: None,
            window_x: None,
            window_y: None,
            stay_awake: true,
            show_touches: false,
            fullscreen: false,
            always_on_top: false,
            turn_screen_off: false,
            enable_audio: false,
            render_driver: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub scrcpy: ScrcpySettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        let configured = self.storage.data_dir.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        home_dir().join(".headset_fleet").join("data")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("HEADSET_FLEET_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    home_dir().join(".headset_fleet_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "headset_fleet_config".to_string());
    path.with_file_name(format!("{stem}.backup.json"))
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_config_path(&path), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.adb.default_port == 0 {
        config.adb.default_port = defaults.adb.default_port;
    }
    if config.adb.connection_timeout_secs == 0 {
        config.adb.connection_timeout_secs = defaults.adb.connection_timeout_secs;
    }
    if config.adb.status_timeout_secs == 0 {
        config.adb.status_timeout_secs = defaults.adb.status_timeout_secs;
    }
    if config.dispatch.max_workers == 0 || config.dispatch.max_workers > 64 {
        config.dispatch.max_workers = defaults.dispatch.max_workers;
    }
    if config.monitor.status_fetch_interval_secs == 0 {
        config.monitor.status_fetch_interval_secs = defaults.monitor.status_fetch_interval_secs;
    }
    if config.monitor.result_max_age_secs == 0 {
        config.monitor.result_max_age_secs = defaults.monitor.result_max_age_secs;
    }
    if config.monitor.result_retention_secs < config.monitor.result_max_age_secs {
        config.monitor.result_retention_secs = config.monitor.result_max_age_secs;
    }
    if config.monitor.battery_low_threshold > 100 {
        config.monitor.battery_low_threshold = defaults.monitor.battery_low_threshold;
    }
    if !(5..=60).contains(&config.network.ping_interval_secs) {
        config.network.ping_interval_secs = defaults.network.ping_interval_secs;
    }
    if !(1..=5).contains(&config.network.ping_timeout_secs) {
        config.network.ping_timeout_secs = defaults.network.ping_timeout_secs;
    }
    if config.network.auto_connect_max_retries == 0 {
        config.network.auto_connect_max_retries = defaults.network.auto_connect_max_retries;
    }
    config
}
