use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::info;

use crate::app::models::{
    Device, DeviceStatus, EndpointState, LiveEndpoint, ProbeSnapshot, StatusChange,
};

/// Status implied by the live listing alone. First match wins: ready, offline, anything else.
pub fn compute_status(state: Option<&EndpointState>) -> DeviceStatus {
    match state {
        Some(EndpointState::Ready) => DeviceStatus::Online,
        Some(EndpointState::Offline) => DeviceStatus::Offline,
        _ => DeviceStatus::NotConnected,
    }
}

/// The listing entry for `device`, trying the serial before the network address.
pub fn find_endpoint<'a>(
    device: &Device,
    endpoints: &'a [LiveEndpoint],
) -> Option<&'a LiveEndpoint> {
    device
        .endpoint_candidates()
        .iter()
        .find_map(|candidate| endpoints.iter().find(|endpoint| &endpoint.address == candidate))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub changes: Vec<StatusChange>,
    /// Serials that are online and past their telemetry interval.
    pub due_for_probe: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Track {
    last_fetch: Option<Instant>,
    last_transition: Option<Instant>,
}

/// Applies reachability observations to device records.
///
/// Also remembers, per device, when telemetry was last fetched and when the status last
/// changed. The latter orders observations from the list scan and the background pings: a
/// ping that completed before the latest committed transition is stale.
pub struct Reconciler {
    probe_interval: Duration,
    tracks: Mutex<HashMap<String, Track>>,
}

impl Reconciler {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            probe_interval,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    fn with_track<R>(&self, serial: &str, f: impl FnOnce(&mut Track) -> R) -> R {
        let mut tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        f(tracks.entry(serial.to_string()).or_default())
    }

    pub fn reconcile(&self, devices: &mut [Device], endpoints: &[LiveEndpoint]) -> ReconcileReport {
        self.reconcile_at(devices, endpoints, Instant::now())
    }

    pub fn reconcile_at(
        &self,
        devices: &mut [Device],
        endpoints: &[LiveEndpoint],
        now: Instant,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for device in devices.iter_mut() {
            let state = find_endpoint(device, endpoints).map(|endpoint| &endpoint.state);
            let status = compute_status(state);
            if status == DeviceStatus::Online {
                device.last_seen = Some(Utc::now());
            }
            if let Some(change) = self.apply_status_at(device, status, now) {
                report.changes.push(change);
            }
            if device.is_online() && self.should_probe_at(&device.serial, now) {
                report.due_for_probe.push(device.serial.clone());
            }
        }
        report
    }

    /// Moves `device` to `status` unless it is already there; only a real transition returns a
    /// change and stamps the transition instant.
    pub fn apply_status_at(
        &self,
        device: &mut Device,
        status: DeviceStatus,
        now: Instant,
    ) -> Option<StatusChange> {
        if device.status.same_lifecycle(status) {
            return None;
        }
        let change = StatusChange {
            serial: device.serial.clone(),
            from: device.status,
            to: status,
        };
        device.status = status;
        if status == DeviceStatus::Online {
            let stamp = Utc::now();
            device.last_seen = Some(stamp);
            device.first_connected.get_or_insert(stamp);
        }
        self.with_track(&device.serial, |track| track.last_transition = Some(now));
        info!(
            serial = %change.serial,
            from = change.from.as_str(),
            to = change.to.as_str(),
            "device status changed"
        );
        Some(change)
    }

    pub fn should_probe_at(&self, serial: &str, now: Instant) -> bool {
        self.with_track(serial, |track| match track.last_fetch {
            Some(fetched) => now.saturating_duration_since(fetched) > self.probe_interval,
            None => true,
        })
    }

    pub fn mark_probed_at(&self, serial: &str, now: Instant) {
        self.with_track(serial, |track| track.last_fetch = Some(now));
    }

    pub fn last_transition(&self, serial: &str) -> Option<Instant> {
        let tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        tracks.get(serial).and_then(|track| track.last_transition)
    }

    /// True when an observation made at `observed_at` predates the device's latest transition.
    pub fn is_stale(&self, serial: &str, observed_at: Instant) -> bool {
        self.last_transition(serial)
            .map(|transition| observed_at < transition)
            .unwrap_or(false)
    }

    pub fn forget(&self, serial: &str) {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(serial);
    }
}

/// Copies telemetry into the record when the probe produced any. Returns whether a stored
/// field changed.
pub fn apply_snapshot(device: &mut Device, snapshot: &ProbeSnapshot) -> bool {
    if !snapshot.has_telemetry() {
        return false;
    }
    let changed = device.battery != snapshot.battery
        || device.temperature != snapshot.temperature
        || device.is_charging != snapshot.is_charging;
    device.battery = snapshot.battery;
    device.temperature = snapshot.temperature;
    device.is_charging = snapshot.is_charging;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, state: &str) -> LiveEndpoint {
        LiveEndpoint::new(address, EndpointState::from_reported(state))
    }

    fn online(serial: &str) -> Device {
        let mut device = Device::new(serial).with_address("192.168.1.20", 5555);
        device.status = DeviceStatus::Online;
        device
    }

    #[test]
    fn absent_online_device_becomes_not_connected_once() {
        let reconciler = Reconciler::new(Duration::from_secs(10));
        let mut devices = vec![online("Q1")];

        let report = reconciler.reconcile(&mut devices, &[]);
        assert_eq!(
            report.changes,
            vec![StatusChange {
                serial: "Q1".to_string(),
                from: DeviceStatus::Online,
                to: DeviceStatus::NotConnected,
            }]
        );
        assert_eq!(devices[0].status, DeviceStatus::NotConnected);

        let again = reconciler.reconcile(&mut devices, &[]);
        assert!(again.changes.is_empty());
    }

    #[test]
    fn same_input_twice_is_idempotent() {
        let reconciler = Reconciler::new(Duration::from_secs(10));
        let mut devices = vec![Device::new("Q1").with_address("192.168.1.20", 5555)];
        let listing = vec![endpoint("192.168.1.20:5555", "device")];

        let first = reconciler.reconcile(&mut devices, &listing);
        assert_eq!(first.changes.len(), 1);
        assert_eq!(devices[0].status, DeviceStatus::Online);
        assert!(devices[0].last_seen.is_some());
        assert!(devices[0].first_connected.is_some());

        let second = reconciler.reconcile(&mut devices, &listing);
        assert!(second.changes.is_empty());
        assert_eq!(devices[0].status, DeviceStatus::Online);
    }

    #[test]
    fn offline_and_unknown_states_map_in_order() {
        assert_eq!(compute_status(Some(&EndpointState::Ready)), DeviceStatus::Online);
        assert_eq!(compute_status(Some(&EndpointState::Offline)), DeviceStatus::Offline);
        assert_eq!(compute_status(Some(&EndpointState::Unauthorized)), DeviceStatus::NotConnected);
        assert_eq!(compute_status(None), DeviceStatus::NotConnected);
    }

    #[test]
    fn serial_match_wins_over_address() {
        let device = Device::new("Q1").with_address("192.168.1.20", 5555);
        let listing = vec![endpoint("192.168.1.20:5555", "offline"), endpoint("Q1", "device")];
        let found = find_endpoint(&device, &listing).expect("endpoint");
        assert_eq!(found.address, "Q1");
    }

    #[test]
    fn adb_not_enabled_is_kept_while_absent() {
        let reconciler = Reconciler::new(Duration::from_secs(10));
        let mut device = Device::new("Q1").with_address("192.168.1.20", 5555);
        device.status = DeviceStatus::AdbNotEnabled;
        let mut devices = vec![device];
        let report = reconciler.reconcile(&mut devices, &[]);
        assert!(report.changes.is_empty());
        assert_eq!(devices[0].status, DeviceStatus::AdbNotEnabled);
    }

    #[test]
    fn telemetry_probe_is_rate_limited() {
        let reconciler = Reconciler::new(Duration::from_secs(10));
        let start = Instant::now();
        let mut devices = vec![online("Q1")];
        let listing = vec![endpoint("192.168.1.20:5555", "device")];

        let report = reconciler.reconcile_at(&mut devices, &listing, start);
        assert_eq!(report.due_for_probe, vec!["Q1".to_string()]);
        reconciler.mark_probed_at("Q1", start);

        let soon = reconciler.reconcile_at(&mut devices, &listing, start + Duration::from_secs(5));
        assert!(soon.due_for_probe.is_empty());

        let later =
            reconciler.reconcile_at(&mut devices, &listing, start + Duration::from_secs(11));
        assert_eq!(later.due_for_probe, vec!["Q1".to_string()]);
    }

    #[test]
    fn observations_before_last_transition_are_stale() {
        let reconciler = Reconciler::new(Duration::from_secs(10));
        let start = Instant::now();
        let mut device = online("Q1");
        assert!(!reconciler.is_stale("Q1", start));

        let dropped_at = start + Duration::from_secs(2);
        reconciler.apply_status_at(&mut device, DeviceStatus::Offline, dropped_at);
        assert!(reconciler.is_stale("Q1", start + Duration::from_secs(1)));
        assert!(!reconciler.is_stale("Q1", start + Duration::from_secs(3)));
    }

    #[test]
    fn empty_snapshot_leaves_telemetry_untouched() {
        let mut device = online("Q1");
        device.battery = 55;
        assert!(!apply_snapshot(&mut device, &ProbeSnapshot::default()));
        assert_eq!(device.battery, 55);

        let snapshot = ProbeSnapshot {
            battery: 80,
            temperature: 30.5,
            is_charging: true,
            ..ProbeSnapshot::default()
        };
        assert!(apply_snapshot(&mut device, &snapshot));
        assert_eq!(device.battery, 80);
        assert!(device.is_charging);
        assert!(!apply_snapshot(&mut device, &snapshot));
    }
}
