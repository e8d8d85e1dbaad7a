use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::app::models::{DeviceInfo, EndpointState, LiveEndpoint, ProbeSnapshot};

pub const POWER_SECTION_MARKER: &str = "---POWER---";
pub const UPTIME_SECTION_MARKER: &str = "---UPTIME---";

fn battery_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"level:\s*(\d+)").expect("valid regex"))
}

fn temperature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"temperature:\s*(-?\d+)").expect("valid regex"))
}

fn ping_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time[=<]\s*([\d.]+)\s*ms").expect("valid regex"))
}

fn inet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"inet (\d+\.\d+\.\d+\.\d+)").expect("valid regex"))
}

pub fn parse_adb_devices(output: &str) -> Vec<LiveEndpoint> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut endpoint =
                LiveEndpoint::new(tokens[0], EndpointState::from_reported(tokens[1]));
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    endpoint.model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    endpoint.transport_id = Some(value.to_string());
                }
            }
            Some(endpoint)
        })
        .collect()
}

/// Parses the combined battery/power/uptime dump. Unknown or malformed lines are skipped and
/// the affected fields keep their [`ProbeSnapshot::default`] values.
pub fn parse_status_output(output: &str) -> ProbeSnapshot {
    let mut snapshot = ProbeSnapshot::default();
    let mut in_uptime_section = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == POWER_SECTION_MARKER {
            in_uptime_section = false;
            continue;
        }
        if trimmed == UPTIME_SECTION_MARKER {
            in_uptime_section = true;
            continue;
        }

        if in_uptime_section {
            match trimmed
                .split_whitespace()
                .next()
                .and_then(|value| value.parse::<f64>().ok())
            {
                Some(uptime) if uptime >= 0.0 => snapshot.uptime_secs = uptime as u64,
                _ => debug!(line = %trimmed, "ignoring malformed uptime line"),
            }
            continue;
        }

        if trimmed.contains("level:") {
            match battery_level_re()
                .captures(trimmed)
                .and_then(|caps| caps[1].parse::<u32>().ok())
            {
                Some(level) => snapshot.battery = level.min(100) as u8,
                None => debug!(line = %trimmed, "ignoring malformed battery line"),
            }
        } else if trimmed.contains("temperature:") {
            match temperature_re()
                .captures(trimmed)
                .and_then(|caps| caps[1].parse::<i32>().ok())
            {
                // Reported in tenths of a degree.
                Some(tenths) => snapshot.temperature = tenths as f32 / 10.0,
                None => debug!(line = %trimmed, "ignoring malformed temperature line"),
            }
        } else if trimmed.contains("powered:") {
            if trimmed.to_lowercase().ends_with("true") {
                snapshot.is_charging = true;
            }
        } else if trimmed.contains("Display Power") {
            snapshot.is_screen_on = trimmed.contains("ON");
        } else if let Some(value) = trimmed.split("mWakefulness=").nth(1) {
            snapshot.is_awake = !(value.starts_with("Asleep") || value.starts_with("Dozing"));
        }
    }

    snapshot
}

/// Round trip time from a single `ping` reply, in milliseconds.
pub fn parse_ping_rtt(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        ping_time_re()
            .captures(line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
    })
}

pub fn parse_wlan_ip(output: &str) -> Option<String> {
    inet_re()
        .captures(output)
        .map(|caps| caps[1].to_string())
        .filter(|ip| !ip.starts_with("127."))
}

/// `adb connect` exits 0 even when it fails, so the verdict comes from the text.
pub fn connect_succeeded(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("already connected") {
        return true;
    }
    if lower.contains("failed") || lower.contains("unable") || lower.contains("cannot") {
        return false;
    }
    lower.contains("connected to")
}

pub fn single_line_value(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| *line != "unknown")
        .map(str::to_string)
}

pub fn build_device_info(serial: &str, model: &str, android_version: &str) -> DeviceInfo {
    DeviceInfo {
        serial: single_line_value(serial),
        model: single_line_value(model),
        android_version: single_line_value(android_version),
    }
}

pub fn split_address(address: &str, default_port: u16) -> Option<(String, u16)> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        None => Some((trimmed.to_string(), default_port)),
    }
}
