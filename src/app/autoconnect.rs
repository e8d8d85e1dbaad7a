use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::ping::Pinger;
use crate::app::adb::transport::Transport;
use crate::app::config::NetworkSettings;
use crate::app::models::{Device, DeviceStatus, PingOutcome};
use crate::app::reconcile::{compute_status, find_endpoint};
use crate::app::retry::RetryPolicy;

/// Devices the background poller should check this tick.
pub fn select_ping_targets<'a>(
    devices: &'a [Device],
    network: &NetworkSettings,
) -> Vec<&'a Device> {
    if !network.enabled {
        return Vec::new();
    }
    let targets = &network.ping_targets;
    devices
        .iter()
        .filter(|device| !targets.only_wifi_devices || device.is_wifi())
        .filter(|device| {
            targets.all_devices || !targets.only_not_connected || device.status.is_not_connected()
        })
        .collect()
}

fn listed_status(
    transport: &dyn Transport,
    device: &Device,
    trace_id: &str,
) -> Option<DeviceStatus> {
    match transport.list_live_endpoints(trace_id) {
        Ok(endpoints) => {
            let state = find_endpoint(device, &endpoints).map(|endpoint| &endpoint.state);
            Some(compute_status(state))
        }
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                serial = %device.serial,
                error = %err,
                "live listing failed"
            );
            None
        }
    }
}

/// One background reachability check, reconnecting over WiFi when allowed.
///
/// `status: None` means the check proposes no change.
pub fn check_and_auto_connect(
    device: &Device,
    transport: &dyn Transport,
    pinger: &dyn Pinger,
    network: &NetworkSettings,
    retries: &RetryPolicy,
    trace_id: &str,
) -> PingOutcome {
    let Some(host) = device.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) else {
        let status = listed_status(transport, device, trace_id);
        return PingOutcome {
            status,
            message: "USB device, status from live listing".to_string(),
            ping_ms: None,
        };
    };

    let timeout = Duration::from_secs(network.ping_timeout_secs.max(1));
    let Some(rtt) = pinger.ping(host, timeout, trace_id) else {
        debug!(trace_id = %trace_id, serial = %device.serial, host = %host, "host unreachable");
        return PingOutcome {
            status: Some(DeviceStatus::NotConnected),
            message: "Host unreachable".to_string(),
            ping_ms: None,
        };
    };
    let ping_ms = Some(rtt);

    if listed_status(transport, device, trace_id) == Some(DeviceStatus::Online) {
        retries.record_success(&device.serial);
        return PingOutcome {
            status: Some(DeviceStatus::Online),
            message: "Connected".to_string(),
            ping_ms,
        };
    }

    if !network.auto_connect {
        return PingOutcome {
            status: Some(DeviceStatus::NotConnected),
            message: "Reachable, auto-connect disabled".to_string(),
            ping_ms,
        };
    }

    let retry_count = retries.retry_count(&device.serial);
    if retry_count >= network.auto_connect_max_retries {
        return PingOutcome {
            status: Some(DeviceStatus::AdbNotEnabled),
            message: format!(
                "Auto-connect gave up after {retry_count} attempts, manual action needed"
            ),
            ping_ms,
        };
    }

    let cooldown = Duration::from_secs(network.auto_connect_cooldown_secs);
    if !retries.should_attempt(&device.serial, cooldown) {
        return PingOutcome {
            status: None,
            message: "Auto-connect cooling down".to_string(),
            ping_ms,
        };
    }

    let address = device.connection_string();
    let outcome = transport.connect(&address, trace_id);
    if outcome.ok {
        retries.record_success(&device.serial);
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            address = %address,
            "auto-connect succeeded"
        );
        PingOutcome {
            status: Some(DeviceStatus::Online),
            message: "Auto-connected".to_string(),
            ping_ms,
        }
    } else {
        let attempts = retries.record_failure(&device.serial);
        warn!(
            trace_id = %trace_id,
            serial = %device.serial,
            attempts,
            detail = %outcome.detail,
            "auto-connect failed"
        );
        PingOutcome {
            status: Some(DeviceStatus::AdbNotEnabled),
            message: format!(
                "Auto-connect failed ({attempts}/{}): {}",
                network.auto_connect_max_retries, outcome.detail
            ),
            ping_ms,
        }
    }
}
