use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    NotConnected,
    /// Host answers pings but wireless debugging refuses the connection. Displayed
    /// separately, reconciled as `NotConnected`.
    AdbNotEnabled,
    Busy,
    Connecting,
    Error,
}

impl DeviceStatus {
    pub fn is_not_connected(self) -> bool {
        matches!(self, DeviceStatus::NotConnected | DeviceStatus::AdbNotEnabled)
    }

    /// Two statuses that only differ in their display sub-state compare equal here.
    pub fn same_lifecycle(self, other: DeviceStatus) -> bool {
        self == other || (self.is_not_connected() && other.is_not_connected())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::NotConnected => "not_connected",
            DeviceStatus::AdbNotEnabled => "adb_not_enabled",
            DeviceStatus::Busy => "busy",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Usb,
    Wifi,
    #[default]
    Unknown,
}

impl ConnectionType {
    pub fn from_target(target: &str) -> Self {
        if target.contains(':') {
            ConnectionType::Wifi
        } else {
            ConnectionType::Usb
        }
    }
}

fn default_port() -> u16 {
    5555
}

fn default_status() -> DeviceStatus {
    DeviceStatus::NotConnected
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub serial: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub android_version: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default = "default_status")]
    pub status: DeviceStatus,
    #[serde(default)]
    pub battery: u8,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub is_charging: bool,
    #[serde(default, skip_serializing)]
    pub ping_ms: Option<f64>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_connected: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            alias: String::new(),
            name: String::new(),
            model: String::new(),
            android_version: String::new(),
            ip: None,
            port: default_port(),
            connection_type: ConnectionType::Unknown,
            status: default_status(),
            battery: 0,
            temperature: 0.0,
            is_charging: false,
            ping_ms: None,
            room_id: None,
            notes: String::new(),
            sort_order: 0,
            last_seen: None,
            first_connected: None,
        }
    }

    pub fn with_address(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.ip = Some(ip.into());
        self.port = port;
        self.connection_type = ConnectionType::Wifi;
        self
    }

    /// Target handed to the transport: `ip:port` when an address is known, else the serial.
    pub fn connection_string(&self) -> String {
        match self.ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => format!("{ip}:{}", self.port),
            _ => self.serial.clone(),
        }
    }

    /// Every identifier the live endpoint listing may use for this device.
    pub fn endpoint_candidates(&self) -> Vec<String> {
        let mut candidates = vec![self.serial.clone()];
        let connection = self.connection_string();
        if connection != self.serial {
            candidates.push(connection);
        }
        candidates
    }

    pub fn display_name(&self) -> String {
        if !self.alias.trim().is_empty() {
            return self.alias.clone();
        }
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        let prefix: String = self.serial.chars().take(8).collect();
        format!("{prefix}...")
    }

    pub fn is_wifi(&self) -> bool {
        self.ip.as_deref().map(|ip| !ip.trim().is_empty()).unwrap_or(false)
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    pub fn is_low_battery(&self, threshold: u8) -> bool {
        self.battery < threshold
    }

    pub fn is_high_temperature(&self, threshold: f32) -> bool {
        self.temperature > threshold
    }
}

/// Latest telemetry for one device. Fields the probe could not read keep these defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProbeSnapshot {
    pub battery: u8,
    pub temperature: f32,
    pub is_charging: bool,
    pub is_screen_on: bool,
    pub is_awake: bool,
    pub uptime_secs: u64,
}

impl Default for ProbeSnapshot {
    fn default() -> Self {
        Self {
            battery: 0,
            temperature: 0.0,
            is_charging: false,
            is_screen_on: false,
            is_awake: true,
            uptime_secs: 0,
        }
    }
}

impl ProbeSnapshot {
    /// A zero battery reading means the probe produced nothing usable.
    pub fn has_telemetry(&self) -> bool {
        self.battery > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Ready,
    Offline,
    Unauthorized,
    Other(String),
}

impl EndpointState {
    pub fn from_reported(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "device" | "ready" => EndpointState::Ready,
            "offline" => EndpointState::Offline,
            "unauthorized" => EndpointState::Unauthorized,
            other => EndpointState::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveEndpoint {
    pub address: String,
    pub state: EndpointState,
    pub model: Option<String>,
    pub transport_id: Option<String>,
}

impl LiveEndpoint {
    pub fn new(address: impl Into<String>, state: EndpointState) -> Self {
        Self {
            address: address.into(),
            state,
            model: None,
            transport_id: None,
        }
    }
}

/// Outcome of a single remote operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpOutcome {
    pub ok: bool,
    pub detail: String,
}

impl OpOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItem<T> {
    pub target: T,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport<T> {
    pub trace_id: String,
    pub success: usize,
    pub failed: usize,
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchReport<T> {
    pub fn from_items(trace_id: impl Into<String>, items: Vec<BatchItem<T>>) -> Self {
        let success = items.iter().filter(|item| item.ok).count();
        Self {
            trace_id: trace_id.into(),
            success,
            failed: items.len() - success,
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub serial: String,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

/// Result of one background reachability check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingOutcome {
    pub status: Option<DeviceStatus>,
    pub message: String,
    pub ping_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_prefers_address() {
        let device = Device::new("1WMHH815K71234").with_address("192.168.1.20", 5555);
        assert_eq!(device.connection_string(), "192.168.1.20:5555");
        assert_eq!(
            device.endpoint_candidates(),
            vec!["1WMHH815K71234".to_string(), "192.168.1.20:5555".to_string()]
        );
        let usb = Device::new("1WMHH815K71234");
        assert_eq!(usb.connection_string(), "1WMHH815K71234");
        assert_eq!(usb.endpoint_candidates().len(), 1);
    }

    #[test]
    fn display_name_falls_back_to_serial_prefix() {
        let mut device = Device::new("1WMHH815K71234");
        assert_eq!(device.display_name(), "1WMHH815...");
        device.name = "Quest 3".to_string();
        assert_eq!(device.display_name(), "Quest 3");
        device.alias = "Q-07".to_string();
        assert_eq!(device.display_name(), "Q-07");
    }

    #[test]
    fn adb_not_enabled_shares_not_connected_lifecycle() {
        assert!(DeviceStatus::AdbNotEnabled.same_lifecycle(DeviceStatus::NotConnected));
        assert!(!DeviceStatus::Online.same_lifecycle(DeviceStatus::Offline));
    }

    #[test]
    fn device_document_tolerates_missing_fields() {
        let value = serde_json::json!({ "serial": "ABC", "status": "online", "ping_ms": 4.2 });
        let device: Device = serde_json::from_value(value).expect("device");
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.port, 5555);
        assert_eq!(device.ping_ms, Some(4.2));
        let stored = serde_json::to_value(&device).expect("serialize");
        assert!(stored.get("ping_ms").is_none());
    }

    #[test]
    fn batch_report_counts_outcomes() {
        let report = BatchReport::from_items(
            "trace",
            vec![
                BatchItem { target: "A", ok: true, detail: String::new() },
                BatchItem { target: "B", ok: false, detail: "boom".to_string() },
            ],
        );
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 1);
    }
}
