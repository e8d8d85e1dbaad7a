use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::parse::{build_device_info, parse_status_output, parse_wlan_ip};
use crate::app::adb::transport::Transport;
use crate::app::models::{DeviceInfo, OpOutcome, ProbeSnapshot};

/// Battery, power and uptime in one round trip. Headsets answer slowly, so one call per
/// metric would multiply the latency.
pub const STATUS_COMMAND: &str = concat!(
    "dumpsys battery | grep -E 'level:|temperature:|powered:'",
    " && echo '---POWER---' && dumpsys power | grep -E 'Display Power|mWakefulness='",
    " && echo '---UPTIME---' && cat /proc/uptime | cut -d' ' -f1",
);

const INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort telemetry for one target. A failed call yields the default snapshot.
pub fn probe(
    transport: &dyn Transport,
    target: &str,
    timeout: Duration,
    trace_id: &str,
) -> ProbeSnapshot {
    let outcome = transport.execute(target, STATUS_COMMAND, timeout, trace_id);
    if !outcome.ok {
        warn!(
            trace_id = %trace_id,
            target = %target,
            detail = %outcome.detail,
            "status probe failed"
        );
        return ProbeSnapshot::default();
    }
    let snapshot = parse_status_output(&outcome.detail);
    debug!(trace_id = %trace_id, target = %target, snapshot = ?snapshot, "status probe");
    snapshot
}

pub fn query_device_info(transport: &dyn Transport, target: &str, trace_id: &str) -> DeviceInfo {
    let read = |outcome: OpOutcome| if outcome.ok { outcome.detail } else { String::new() };
    let model = read(transport.execute(target, "getprop ro.product.model", INFO_TIMEOUT, trace_id));
    let android_version = read(transport.execute(
        target,
        "getprop ro.build.version.release",
        INFO_TIMEOUT,
        trace_id,
    ));
    let serial = read(transport.host_command(target, &["get-serialno"], INFO_TIMEOUT, trace_id));
    build_device_info(&serial, &model, &android_version)
}

pub fn query_wlan_ip(transport: &dyn Transport, target: &str, trace_id: &str) -> Option<String> {
    let outcome = transport.execute(target, "ip addr show wlan0", INFO_TIMEOUT, trace_id);
    if !outcome.ok {
        return None;
    }
    parse_wlan_ip(&outcome.detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeTransport;

    #[test]
    fn probe_makes_one_combined_call() {
        let transport = FakeTransport::new();
        transport.respond(
            STATUS_COMMAND,
            OpOutcome::success(concat!(
                "level: 64\ntemperature: 312\nAC powered: true\n",
                "---POWER---\nDisplay Power: state=OFF\nmWakefulness=Asleep\n",
                "---UPTIME---\n99.5\n",
            )),
        );

        let snapshot = probe(&transport, "192.168.1.20:5555", Duration::from_secs(15), "t");

        assert_eq!(transport.executed().len(), 1);
        assert_eq!(snapshot.battery, 64);
        assert!((snapshot.temperature - 31.2).abs() < 0.001);
        assert!(snapshot.is_charging);
        assert!(!snapshot.is_screen_on);
        assert!(!snapshot.is_awake);
        assert_eq!(snapshot.uptime_secs, 99);
    }

    #[test]
    fn failed_probe_yields_default_snapshot() {
        let transport = FakeTransport::new();
        transport.respond(STATUS_COMMAND, OpOutcome::failure("timed out"));
        let snapshot = probe(&transport, "A", Duration::from_secs(1), "t");
        assert_eq!(snapshot, ProbeSnapshot::default());
        assert!(!snapshot.has_telemetry());
    }

    #[test]
    fn reads_device_info_and_ip() {
        let transport = FakeTransport::new();
        transport.respond("getprop ro.product.model", OpOutcome::success("Quest 3\n"));
        transport.respond("getprop ro.build.version.release", OpOutcome::success("12\n"));
        transport.respond("get-serialno", OpOutcome::success("2G0YC5ZF9F\n"));
        transport.respond(
            "ip addr show wlan0",
            OpOutcome::success("    inet 10.0.0.31/24 brd 10.0.0.255 scope global wlan0\n"),
        );

        let info = query_device_info(&transport, "2G0YC5ZF9F", "t");
        assert_eq!(info.model.as_deref(), Some("Quest 3"));
        assert_eq!(info.android_version.as_deref(), Some("12"));
        assert_eq!(info.serial.as_deref(), Some("2G0YC5ZF9F"));
        assert_eq!(query_wlan_ip(&transport, "2G0YC5ZF9F", "t").as_deref(), Some("10.0.0.31"));
    }
}
