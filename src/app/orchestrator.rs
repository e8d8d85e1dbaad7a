use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::actions::{pause, ActionExecutor, ActionPacing, ActionRegistry};
use crate::app::adb::parse::split_address;
use crate::app::adb::ping::Pinger;
use crate::app::adb::scrcpy::{MirrorOptions, ScreenLauncher};
use crate::app::adb::transport::Transport;
use crate::app::autoconnect::select_ping_targets;
use crate::app::config::AppConfig;
use crate::app::dispatch::{dispatch, ProgressFn};
use crate::app::error::AppError;
use crate::app::models::{
    BatchItem, BatchReport, ConnectionType, Device, DeviceStatus, OpOutcome, ProbeSnapshot,
    StatusChange,
};
use crate::app::poll::PollService;
use crate::app::prober::{probe, query_device_info, query_wlan_ip};
use crate::app::reconcile::{apply_snapshot, compute_status, find_endpoint, Reconciler};
use crate::app::registry::{DeviceRegistry, FleetStatistics};
use crate::app::retry::RetryPolicy;
use crate::app::rooms::RoomRegistry;
use crate::app::scheduler::TaskScheduler;

/// Device, action and room registries, one JSON file each under the data directory.
pub struct Stores {
    pub devices: DeviceRegistry,
    pub actions: ActionRegistry,
    pub rooms: RoomRegistry,
}

impl Stores {
    pub fn open(data_dir: &Path, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            devices: DeviceRegistry::open(data_dir.join("devices.json"), trace_id)?,
            actions: ActionRegistry::open(data_dir.join("actions.json"), trace_id)?,
            rooms: RoomRegistry::open(data_dir.join("rooms.json"), trace_id)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeBatch {
    pub report: BatchReport<String>,
    pub snapshots: BTreeMap<String, ProbeSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub trace_id: String,
    pub changes: Vec<StatusChange>,
    pub probed: Vec<String>,
    pub persisted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollTick {
    pub trace_id: String,
    pub submitted: usize,
    pub updated: Vec<String>,
    pub in_flight: usize,
    pub oldest_in_flight_ms: Option<u64>,
    pub expired: usize,
}

fn describe_snapshot(snapshot: &ProbeSnapshot) -> String {
    format!(
        "battery {}%, {:.1}C{}, screen {}, {}, up {}s",
        snapshot.battery,
        snapshot.temperature,
        if snapshot.is_charging { ", charging" } else { "" },
        if snapshot.is_screen_on { "on" } else { "off" },
        if snapshot.is_awake { "awake" } else { "asleep" },
        snapshot.uptime_secs
    )
}

/// Drops the lock key or title carried next to each address during dispatch.
fn by_address<T>(items: Vec<BatchItem<(String, T)>>) -> Vec<BatchItem<String>> {
    items
        .into_iter()
        .map(|item| BatchItem {
            target: item.target.0,
            ok: item.ok,
            detail: item.detail,
        })
        .collect()
}

/// Owns every collaborator of the fleet core and the background poller. Build one per
/// process with [`Orchestrator::new`] and stop it with [`Orchestrator::shutdown`].
pub struct Orchestrator {
    config: AppConfig,
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn ScreenLauncher>,
    scheduler: Arc<TaskScheduler>,
    retries: Arc<RetryPolicy>,
    reconciler: Reconciler,
    poll: PollService,
    stores: Stores,
    pacing: ActionPacing,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        pinger: Arc<dyn Pinger>,
        launcher: Arc<dyn ScreenLauncher>,
        stores: Stores,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let workers = config.dispatch.max_workers;
        if workers == 0 {
            return Err(AppError::validation("max_workers must be at least 1", trace_id));
        }
        let scheduler = Arc::new(TaskScheduler::new(workers));
        let retries = Arc::new(RetryPolicy::new());
        let poll = PollService::new(
            workers,
            Duration::from_secs(config.monitor.result_max_age_secs),
            Arc::clone(&transport),
            pinger,
            Arc::clone(&retries),
            Arc::clone(&scheduler),
            trace_id,
        )?;
        info!(trace_id = %trace_id, workers, "orchestrator started");
        let probe_interval = Duration::from_secs(config.monitor.status_fetch_interval_secs);
        Ok(Self {
            reconciler: Reconciler::new(probe_interval),
            config,
            transport,
            launcher,
            scheduler,
            retries,
            poll,
            stores,
            pacing: ActionPacing::default(),
        })
    }

    pub fn with_pacing(mut self, pacing: ActionPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Stops the background poller. Returns false when checks were still running at the
    /// deadline.
    pub fn shutdown(&self) -> bool {
        self.poll
            .shutdown(Duration::from_secs(self.config.monitor.shutdown_timeout_secs))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn retries(&self) -> &RetryPolicy {
        &self.retries
    }

    pub fn devices(&self) -> Vec<Device> {
        self.stores.devices.all()
    }

    pub fn statistics(&self) -> FleetStatistics {
        self.stores.devices.statistics(
            self.config.monitor.battery_low_threshold,
            self.config.monitor.temperature_high_threshold,
        )
    }

    fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.config.adb.status_timeout_secs)
    }

    fn max_workers(&self) -> usize {
        self.config.dispatch.max_workers
    }

    /// Transport address and lock key for a serial or address. Registered devices are reached
    /// through their connection string and locked on their serial, so every path to one
    /// headset shares a lock. Unregistered targets use the raw target for both.
    fn resolve_target(&self, target: &str) -> (String, String) {
        match self.stores.devices.find(target) {
            Some(device) => (device.connection_string(), device.serial),
            None => (target.to_string(), target.to_string()),
        }
    }

    fn lock_key(&self, target: &str) -> String {
        self.resolve_target(target).1
    }

    pub fn connect_batch(
        &self,
        addresses: Vec<String>,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<BatchReport<String>, AppError> {
        let default_port = self.config.adb.default_port;
        let mut normalized = Vec::with_capacity(addresses.len());
        for address in &addresses {
            let (host, port) = split_address(address, default_port).ok_or_else(|| {
                AppError::validation(format!("Invalid address: {address}"), trace_id)
            })?;
            normalized.push(format!("{host}:{port}"));
        }

        let jobs: Vec<(String, String)> = normalized
            .into_iter()
            .map(|address| {
                let serial = self.lock_key(&address);
                (address, serial)
            })
            .collect();

        let items = dispatch(
            jobs,
            |(address, serial)| {
                self.scheduler
                    .run_exclusive(serial, || self.transport.connect(address, trace_id))
            },
            self.max_workers(),
            on_progress,
            trace_id,
        )?;
        let items = by_address(items);

        let now = Instant::now();
        let mut changed = Vec::new();
        for item in items.iter().filter(|item| item.ok) {
            if let Some(mut device) = self.stores.devices.find(&item.target) {
                self.retries.record_success(&device.serial);
                if self
                    .reconciler
                    .apply_status_at(&mut device, DeviceStatus::Online, now)
                    .is_some()
                {
                    changed.push(device);
                }
            }
        }
        self.stores.devices.save_many(changed, trace_id)?;
        Ok(BatchReport::from_items(trace_id, items))
    }

    /// Probes every target once, concurrently, and folds telemetry into registered devices.
    pub fn probe_batch(
        &self,
        targets: Vec<String>,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<ProbeBatch, AppError> {
        let resolved: Vec<(String, String)> =
            targets.iter().map(|target| self.resolve_target(target)).collect();
        let (report, snapshots) = self.probe_targets(resolved, on_progress, trace_id)?;

        let now = Instant::now();
        let mut changed = Vec::new();
        for (target, snapshot) in &snapshots {
            if let Some(mut device) = self.stores.devices.find(target) {
                self.reconciler.mark_probed_at(&device.serial, now);
                if apply_snapshot(&mut device, snapshot) {
                    changed.push(device);
                }
            }
        }
        self.stores.devices.save_many(changed, trace_id)?;
        Ok(ProbeBatch { report, snapshots })
    }

    /// Probes `(address, lock key)` pairs; snapshots are keyed by address.
    fn probe_targets(
        &self,
        targets: Vec<(String, String)>,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<(BatchReport<String>, BTreeMap<String, ProbeSnapshot>), AppError> {
        let snapshots = Mutex::new(BTreeMap::new());
        let timeout = self.status_timeout();
        let items = dispatch(
            targets,
            |(target, serial)| {
                let snapshot = self.scheduler.run_exclusive(serial, || {
                    probe(self.transport.as_ref(), target, timeout, trace_id)
                });
                snapshots
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(target.clone(), snapshot);
                if snapshot.has_telemetry() {
                    OpOutcome::success(describe_snapshot(&snapshot))
                } else {
                    OpOutcome::failure("No telemetry")
                }
            },
            self.max_workers(),
            on_progress,
            trace_id,
        )?;
        let snapshots = snapshots.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok((BatchReport::from_items(trace_id, by_address(items)), snapshots))
    }

    pub fn run_action_batch(
        &self,
        action_id: &str,
        targets: Vec<String>,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<BatchReport<String>, AppError> {
        let action = self
            .stores
            .actions
            .get(action_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown action: {action_id}"), trace_id))?;
        let resolved: Vec<(String, String)> =
            targets.iter().map(|target| self.resolve_target(target)).collect();
        let executor = ActionExecutor::new(
            self.transport.as_ref(),
            self.status_timeout(),
            self.pacing,
            trace_id,
        );

        let items = dispatch(
            resolved,
            |(target, serial)| {
                self.scheduler
                    .run_exclusive(serial, || executor.execute(target, &action))
            },
            self.max_workers(),
            on_progress,
            trace_id,
        )?;
        let items = by_address(items);

        let results: Vec<bool> = items.iter().map(|item| item.ok).collect();
        if let Err(err) = self.stores.actions.record_execution(action_id, &results, trace_id) {
            warn!(
                trace_id = %trace_id,
                action_id = %action_id,
                error = %err,
                "failed to record action statistics"
            );
        }
        Ok(BatchReport::from_items(trace_id, items))
    }

    /// Runs an action on every device assigned to the room.
    pub fn run_room_action(
        &self,
        room_id: &str,
        action_id: &str,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<BatchReport<String>, AppError> {
        let serials = self.stores.rooms.device_ids(room_id, trace_id)?;
        self.run_action_batch(action_id, serials, on_progress, trace_id)
    }

    pub fn launch_mirror_batch(
        &self,
        targets: Vec<String>,
        options: &MirrorOptions,
        on_progress: Option<ProgressFn<'_>>,
        trace_id: &str,
    ) -> Result<BatchReport<String>, AppError> {
        let Some(version) = self.launcher.check_available() else {
            return Err(AppError::dependency("scrcpy is not installed or cannot run", trace_id));
        };
        info!(
            trace_id = %trace_id,
            version = %version,
            targets = targets.len(),
            "launching mirrors"
        );
        let jobs: Vec<(String, String)> = targets
            .iter()
            .map(|target| match self.stores.devices.find(target) {
                Some(device) => (device.connection_string(), device.display_name()),
                None => (target.clone(), target.clone()),
            })
            .collect();

        let items = dispatch(
            jobs,
            |(target, title)| self.launcher.launch(target, title, options),
            self.max_workers(),
            on_progress,
            trace_id,
        )?;
        Ok(BatchReport::from_items(trace_id, by_address(items)))
    }

    /// One synchronous reconciliation pass: list scan, status transitions, rate-limited
    /// telemetry for online devices, then persistence of what changed.
    pub fn sync_devices(&self, trace_id: &str) -> Result<SyncReport, AppError> {
        let mut devices = self.stores.devices.all();
        if devices.is_empty() {
            return Ok(SyncReport {
                trace_id: trace_id.to_string(),
                ..SyncReport::default()
            });
        }
        let endpoints = self.transport.list_live_endpoints(trace_id)?;
        let report = self.reconciler.reconcile(&mut devices, &endpoints);

        let mut dirty: HashSet<String> =
            report.changes.iter().map(|change| change.serial.clone()).collect();
        dirty.extend(
            devices
                .iter()
                .filter(|device| device.is_online())
                .map(|device| device.serial.clone()),
        );

        let mut probed = Vec::new();
        if !report.due_for_probe.is_empty() {
            let due: Vec<&Device> = devices
                .iter()
                .filter(|device| report.due_for_probe.contains(&device.serial))
                .collect();
            let targets: Vec<(String, String)> = due
                .iter()
                .map(|device| (device.connection_string(), device.serial.clone()))
                .collect();
            let by_target: BTreeMap<String, String> = due
                .iter()
                .map(|device| (device.connection_string(), device.serial.clone()))
                .collect();
            let (_, snapshots) = self.probe_targets(targets, None, trace_id)?;

            let now = Instant::now();
            for (target, snapshot) in &snapshots {
                let Some(serial) = by_target.get(target) else {
                    continue;
                };
                self.reconciler.mark_probed_at(serial, now);
                if let Some(device) = devices.iter_mut().find(|device| &device.serial == serial) {
                    if apply_snapshot(device, snapshot) {
                        dirty.insert(serial.clone());
                    }
                }
                probed.push(serial.clone());
            }
        }

        let to_save: Vec<Device> = devices
            .into_iter()
            .filter(|device| dirty.contains(&device.serial))
            .collect();
        let persisted = to_save.len();
        self.stores.devices.save_many(to_save, trace_id)?;
        info!(
            trace_id = %trace_id,
            changes = report.changes.len(),
            probed = probed.len(),
            persisted,
            "device sync finished"
        );
        Ok(SyncReport {
            trace_id: trace_id.to_string(),
            changes: report.changes,
            probed,
            persisted,
        })
    }

    /// One background monitoring tick. Never waits on a ping: queues new checks, folds in
    /// the ones that finished since the last tick and persists the devices they changed.
    pub fn poll_tick(&self, trace_id: &str) -> Result<PollTick, AppError> {
        let network = &self.config.network;
        let mut devices = self.stores.devices.all();
        let submitted = {
            let targets = select_ping_targets(&devices, network);
            self.poll.submit(&targets, network, trace_id)?
        };

        let updated = self.poll.collect(&mut devices, &self.reconciler);
        let serials: Vec<String> = updated.iter().map(|device| device.serial.clone()).collect();
        self.stores.devices.save_many(updated, trace_id)?;
        let expired = self
            .poll
            .cleanup_old_results(Duration::from_secs(self.config.monitor.result_retention_secs));

        Ok(PollTick {
            trace_id: trace_id.to_string(),
            submitted,
            updated: serials,
            in_flight: self.poll.in_flight_count(),
            oldest_in_flight_ms: self
                .poll
                .oldest_in_flight()
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
            expired,
        })
    }

    /// Registers (or refreshes) the device behind `target`, reading its identity over the
    /// transport.
    pub fn register_device(
        &self,
        target: &str,
        alias: Option<&str>,
        trace_id: &str,
    ) -> Result<Device, AppError> {
        let info = self.scheduler.run_exclusive(&self.lock_key(target), || {
            query_device_info(self.transport.as_ref(), target, trace_id)
        });
        if info.serial.is_none() && info.model.is_none() {
            return Err(AppError::dependency(format!("Device not reachable: {target}"), trace_id));
        }
        let serial = info.serial.clone().unwrap_or_else(|| target.to_string());

        let mut device = self
            .stores
            .devices
            .get(&serial)
            .unwrap_or_else(|| Device::new(serial.clone()));
        if let Some(model) = info.model {
            device.name = model.clone();
            device.model = model;
        }
        if let Some(version) = info.android_version {
            device.android_version = version;
        }
        if let Some(alias) = alias.map(str::trim).filter(|alias| !alias.is_empty()) {
            device.alias = alias.to_string();
        }
        match split_address(target, self.config.adb.default_port).filter(|_| target.contains(':')) {
            Some((host, port)) => {
                device.ip = Some(host);
                device.port = port;
                device.connection_type = ConnectionType::Wifi;
            }
            // The WiFi address is only recorded once the device actually listens on TCP.
            None => device.connection_type = ConnectionType::Usb,
        }

        let endpoints = self.transport.list_live_endpoints(trace_id).unwrap_or_default();
        let state = find_endpoint(&device, &endpoints).map(|endpoint| &endpoint.state);
        let status = compute_status(state);
        self.reconciler.apply_status_at(&mut device, status, Instant::now());

        self.stores.devices.save(device, trace_id)
    }

    /// Switches a USB device to adb over TCP and connects to it over WiFi.
    pub fn promote_to_wifi(&self, serial: &str, trace_id: &str) -> Result<Device, AppError> {
        let mut device = self
            .stores
            .devices
            .get(serial)
            .ok_or_else(|| AppError::not_found(format!("Unknown device: {serial}"), trace_id))?;
        let port = self.config.adb.default_port;
        let port_arg = port.to_string();

        let ip = self.scheduler.run_exclusive(serial, || -> Result<String, AppError> {
            let ip = query_wlan_ip(self.transport.as_ref(), serial, trace_id).ok_or_else(|| {
                AppError::dependency(format!("No WiFi address for {serial}"), trace_id)
            })?;
            let enabled = self.transport.host_command(
                serial,
                &["tcpip", port_arg.as_str()],
                Duration::from_secs(self.config.adb.connection_timeout_secs),
                trace_id,
            );
            if !enabled.ok {
                let message = format!("tcpip failed: {}", enabled.detail);
                return Err(AppError::dependency(message, trace_id));
            }
            pause(self.pacing.tcpip_settle);
            let address = format!("{ip}:{port}");
            let connected = self.transport.connect(&address, trace_id);
            if !connected.ok {
                let message = format!("Connect failed: {}", connected.detail);
                return Err(AppError::dependency(message, trace_id));
            }
            Ok(ip)
        })?;

        device.ip = Some(ip);
        device.port = port;
        device.connection_type = ConnectionType::Wifi;
        self.retries.record_success(&device.serial);
        self.reconciler
            .apply_status_at(&mut device, DeviceStatus::Online, Instant::now());
        info!(
            trace_id = %trace_id,
            serial = %serial,
            address = %device.connection_string(),
            "device promoted to wifi"
        );
        self.stores.devices.save(device, trace_id)
    }

    /// Forgets a device: closes its WiFi connection, drops it from its room and clears the
    /// retry and status tracking kept for it. Returns the removed record.
    pub fn remove_device(&self, serial: &str, trace_id: &str) -> Result<Device, AppError> {
        let device = self
            .stores
            .devices
            .get(serial)
            .ok_or_else(|| AppError::not_found(format!("Unknown device: {serial}"), trace_id))?;
        if device.is_wifi() {
            let address = device.connection_string();
            let outcome = self
                .scheduler
                .run_exclusive(serial, || self.transport.disconnect(&address, trace_id));
            if !outcome.ok {
                warn!(
                    trace_id = %trace_id,
                    serial = %serial,
                    detail = %outcome.detail,
                    "disconnect failed"
                );
            }
        }
        if let Some(room) = self.stores.rooms.room_of(serial) {
            self.stores.rooms.remove_device(&room.room_id, serial, trace_id)?;
        }
        self.stores.devices.remove(serial, trace_id)?;
        self.reconciler.forget(serial);
        self.retries.record_success(serial);
        Ok(device)
    }

    /// Assigns the device to a room and mirrors the assignment on the device record.
    pub fn assign_room(&self, room_id: &str, serial: &str, trace_id: &str) -> Result<(), AppError> {
        let mut device = self
            .stores
            .devices
            .get(serial)
            .ok_or_else(|| AppError::not_found(format!("Unknown device: {serial}"), trace_id))?;
        self.stores.rooms.add_device(room_id, serial, trace_id)?;
        device.room_id = Some(room_id.to_string());
        self.stores.devices.save(device, trace_id)?;
        Ok(())
    }

    pub fn unassign_room(
        &self,
        room_id: &str,
        serial: &str,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let removed = self.stores.rooms.remove_device(room_id, serial, trace_id)?;
        if removed {
            if let Some(mut device) = self.stores.devices.get(serial) {
                device.room_id = None;
                self.stores.devices.save(device, trace_id)?;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::actions::ActionType;
    use crate::app::prober::STATUS_COMMAND;
    use crate::app::testing::{FakeLauncher, FakePinger, FakeTransport};
    use std::thread;

    struct Harness {
        _dir: tempfile::TempDir,
        transport: Arc<FakeTransport>,
        pinger: Arc<FakePinger>,
        launcher: Arc<FakeLauncher>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let stores = Stores::open(dir.path(), "t").expect("stores");
        let transport = Arc::new(FakeTransport::new());
        let pinger = Arc::new(FakePinger::new());
        let launcher = Arc::new(FakeLauncher::new());
        let orchestrator = Orchestrator::new(
            AppConfig::default(),
            transport.clone(),
            pinger.clone(),
            launcher.clone(),
            stores,
            "t",
        )
        .expect("orchestrator")
        .with_pacing(ActionPacing::immediate());
        Harness {
            _dir: dir,
            transport,
            pinger,
            launcher,
            orchestrator,
        }
    }

    fn register(h: &Harness, serial: &str, ip: &str, status: DeviceStatus) -> Device {
        let mut device = Device::new(serial).with_address(ip, 5555);
        device.status = status;
        h.orchestrator.stores().devices.register(device, "t").expect("register")
    }

    const STATUS_OUTPUT: &str = concat!(
        "level: 76\ntemperature: 301\nUSB powered: false\n",
        "---POWER---\nDisplay Power: state=ON\nmWakefulness=Awake\n",
        "---UPTIME---\n4200.1\n",
    );

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.max_workers = 0;
        let dir = tempfile::tempdir().expect("tempdir");
        let stores = Stores::open(dir.path(), "t").expect("stores");
        let err = Orchestrator::new(
            config,
            Arc::new(FakeTransport::new()),
            Arc::new(FakePinger::new()),
            Arc::new(FakeLauncher::new()),
            stores,
            "t",
        )
        .err()
        .expect("error");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn connect_batch_reports_mixed_results_and_marks_known_devices_online() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::NotConnected);
        h.transport
            .connect_result("10.0.0.1:5555", OpOutcome::success("connected to 10.0.0.1:5555"));

        let report = h
            .orchestrator
            .connect_batch(vec!["10.0.0.1".to_string(), "10.0.0.2:5555".to_string()], None, "t")
            .expect("connect");
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            h.orchestrator.stores().devices.get("Q1").map(|d| d.status),
            Some(DeviceStatus::Online)
        );

        let err = h
            .orchestrator
            .connect_batch(vec!["10.0.0.3:notaport".to_string()], None, "t")
            .expect_err("invalid");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn sync_reconciles_and_probes_online_devices() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::NotConnected);
        register(&h, "Q2", "10.0.0.2", DeviceStatus::Online);
        h.transport.set_endpoints(&[("10.0.0.1:5555", "device")]);
        h.transport
            .respond_for("10.0.0.1:5555", STATUS_COMMAND, OpOutcome::success(STATUS_OUTPUT));

        let report = h.orchestrator.sync_devices("t").expect("sync");
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.probed, vec!["Q1".to_string()]);

        let q1 = h.orchestrator.stores().devices.get("Q1").expect("Q1");
        assert_eq!(q1.status, DeviceStatus::Online);
        assert_eq!(q1.battery, 76);
        assert!(q1.last_seen.is_some());
        let q2 = h.orchestrator.stores().devices.get("Q2").expect("Q2");
        assert_eq!(q2.status, DeviceStatus::NotConnected);

        // Within the telemetry interval the second pass neither changes nor probes.
        let again = h.orchestrator.sync_devices("t").expect("sync");
        assert!(again.changes.is_empty());
        assert!(again.probed.is_empty());
        assert_eq!(h.transport.commands_for("10.0.0.1:5555").len(), 1);
    }

    #[test]
    fn sync_surfaces_listing_failure() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        h.transport.fail_listing("adb server not running");
        let err = h.orchestrator.sync_devices("trace-s").expect_err("listing");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(err.trace_id, "trace-s");
    }

    #[test]
    fn probe_batch_applies_only_real_telemetry() {
        let h = harness();
        let mut known = register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        known.battery = 40;
        h.orchestrator.stores().devices.save(known, "t").expect("save");
        register(&h, "Q2", "10.0.0.2", DeviceStatus::Online);
        h.transport
            .respond_for("10.0.0.2:5555", STATUS_COMMAND, OpOutcome::success(STATUS_OUTPUT));

        let batch = h
            .orchestrator
            .probe_batch(vec!["Q1".to_string(), "Q2".to_string()], None, "t")
            .expect("probe");
        assert_eq!(batch.report.success, 1);
        assert_eq!(batch.report.failed, 1);
        assert_eq!(batch.snapshots.len(), 2);
        assert_eq!(h.orchestrator.stores().devices.get("Q1").map(|d| d.battery), Some(40));
        assert_eq!(h.orchestrator.stores().devices.get("Q2").map(|d| d.battery), Some(76));
    }

    #[test]
    fn action_batch_isolates_failures_and_records_statistics() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        register(&h, "Q2", "10.0.0.2", DeviceStatus::Online);
        h.transport
            .respond_for("10.0.0.1:5555", "input keyevent KEYCODE_HOME", OpOutcome::success(""));
        let action = h
            .orchestrator
            .stores()
            .actions
            .create(
                "Home",
                None,
                ActionType::SendKey,
                serde_json::json!({ "keycode": "KEYCODE_HOME" })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                "t",
            )
            .expect("action");

        let progress = Mutex::new(Vec::new());
        let on_progress = |done: usize, total: usize| {
            progress.lock().unwrap().push((done, total));
        };
        let report = h
            .orchestrator
            .run_action_batch(
                &action.action_id,
                vec!["Q1".to_string(), "Q2".to_string()],
                Some(&on_progress),
                "t",
            )
            .expect("run");

        assert_eq!(report.items.len(), 2);
        assert_eq!(report.success, 1);
        let failed: Vec<_> = report.items.iter().filter(|item| !item.ok).collect();
        assert_eq!(failed[0].target, "10.0.0.2:5555");
        assert_eq!(*progress.lock().unwrap(), vec![(1, 2), (2, 2)]);

        let stored = h.orchestrator.stores().actions.get(&action.action_id).expect("stored");
        assert_eq!(stored.execution_count, 2);
        assert_eq!(stored.success_count, 1);

        let err = h
            .orchestrator
            .run_action_batch("missing", vec!["Q1".to_string()], None, "t")
            .expect_err("unknown action");
        assert_eq!(err.code, "ERR_NOT_FOUND");
    }

    fn home_action(h: &Harness) -> String {
        h.orchestrator
            .stores()
            .actions
            .create(
                "Home",
                None,
                ActionType::SendKey,
                serde_json::json!({ "keycode": "KEYCODE_HOME" })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                "t",
            )
            .expect("action")
            .action_id
    }

    #[test]
    fn batches_by_address_wait_on_the_serial_lock() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        h.transport.respond("input keyevent KEYCODE_HOME", OpOutcome::success(""));
        h.transport
            .connect_result("10.0.0.1:5555", OpOutcome::success("connected to 10.0.0.1:5555"));
        let action_id = home_action(&h);

        let lock = h.orchestrator.scheduler.device_lock("Q1");
        let held = lock.lock().unwrap();
        thread::scope(|scope| {
            let action = scope.spawn(|| {
                h.orchestrator
                    .run_action_batch(&action_id, vec!["10.0.0.1:5555".to_string()], None, "t")
            });
            let connect = scope.spawn(|| {
                h.orchestrator
                    .connect_batch(vec!["10.0.0.1".to_string()], None, "t")
            });

            thread::sleep(Duration::from_millis(100));
            assert!(h.transport.executed().is_empty());
            assert!(h.transport.connects().is_empty());
            drop(held);

            assert_eq!(action.join().expect("join").expect("run").success, 1);
            assert_eq!(connect.join().expect("join").expect("connect").success, 1);
        });
        assert_eq!(h.transport.commands_for("10.0.0.1:5555").len(), 1);
    }

    #[test]
    fn remove_device_clears_every_trace() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        h.transport.set_endpoints(&[("10.0.0.1:5555", "device")]);
        let room = h.orchestrator.stores().rooms.create("Lab A", None, 0, "t").expect("room");
        h.orchestrator.assign_room(&room.room_id, "Q1", "t").expect("assign");
        h.orchestrator.retries().record_failure("Q1");
        h.orchestrator.reconciler.mark_probed_at("Q1", Instant::now());

        let removed = h.orchestrator.remove_device("Q1", "t").expect("remove");
        assert_eq!(removed.serial, "Q1");
        assert!(h.orchestrator.devices().is_empty());
        assert!(h
            .orchestrator
            .stores()
            .rooms
            .device_ids(&room.room_id, "t")
            .expect("room")
            .is_empty());
        assert_eq!(h.orchestrator.retries().retry_count("Q1"), 0);
        assert!(h.orchestrator.reconciler.should_probe_at("Q1", Instant::now()));
        assert!(h.transport.list_live_endpoints("t").expect("list").is_empty());

        let err = h.orchestrator.remove_device("Q1", "t").expect_err("gone");
        assert_eq!(err.code, "ERR_NOT_FOUND");
    }

    #[test]
    fn mirror_batch_requires_scrcpy() {
        let h = harness();
        h.launcher.uninstall();
        let err = h
            .orchestrator
            .launch_mirror_batch(
                vec!["10.0.0.9:5555".to_string()],
                &MirrorOptions::default(),
                None,
                "t",
            )
            .expect_err("missing scrcpy");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(h.launcher.launches().is_empty());
    }

    #[test]
    fn room_action_targets_room_members() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        register(&h, "Q2", "10.0.0.2", DeviceStatus::Online);
        let room = h.orchestrator.stores().rooms.create("Lab A", None, 0, "t").expect("room");
        h.orchestrator.assign_room(&room.room_id, "Q2", "t").expect("assign");
        assert_eq!(
            h.orchestrator.stores().devices.get("Q2").and_then(|d| d.room_id),
            Some(room.room_id.clone())
        );
        h.transport.respond("input keyevent KEYCODE_WAKEUP", OpOutcome::success(""));
        let action = h
            .orchestrator
            .stores()
            .actions
            .create(
                "Wake",
                None,
                ActionType::WakeUp,
                serde_json::json!({ "verify": false }).as_object().cloned().unwrap_or_default(),
                "t",
            )
            .expect("action");

        let report = h
            .orchestrator
            .run_room_action(&room.room_id, &action.action_id, None, "t")
            .expect("room run");
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].target, "10.0.0.2:5555");
        assert!(h.transport.commands_for("10.0.0.1:5555").is_empty());

        assert!(h.orchestrator.unassign_room(&room.room_id, "Q2", "t").expect("unassign"));
        assert_eq!(h.orchestrator.stores().devices.get("Q2").and_then(|d| d.room_id), None);
    }

    #[test]
    fn mirror_batch_uses_display_names() {
        let h = harness();
        let mut device = Device::new("Q1").with_address("10.0.0.1", 5555);
        device.alias = "Seat 4".to_string();
        h.orchestrator.stores().devices.register(device, "t").expect("register");
        h.launcher.fail_for("10.0.0.9:5555");

        let report = h
            .orchestrator
            .launch_mirror_batch(
                vec!["Q1".to_string(), "10.0.0.9:5555".to_string()],
                &MirrorOptions::default(),
                None,
                "t",
            )
            .expect("mirror");
        assert_eq!(report.success, 1);
        let mut launches = h.launcher.launches();
        launches.sort();
        assert_eq!(
            launches,
            vec![
                ("10.0.0.1:5555".to_string(), "Seat 4".to_string()),
                ("10.0.0.9:5555".to_string(), "10.0.0.9:5555".to_string()),
            ]
        );
    }

    #[test]
    fn poll_tick_auto_connects_in_background() {
        let h = harness();
        register(&h, "Q1", "10.0.0.1", DeviceStatus::NotConnected);
        h.pinger.reachable("10.0.0.1", 2.0);
        h.transport
            .connect_result("10.0.0.1:5555", OpOutcome::success("connected to 10.0.0.1:5555"));

        h.pinger.set_delay(Duration::from_millis(50));
        let first = h.orchestrator.poll_tick("t").expect("tick");
        assert_eq!(first.submitted, 1);
        assert_eq!(first.in_flight, 1);
        assert!(first.oldest_in_flight_ms.is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        // A fast check may already have landed in the first tick's collect.
        let mut updated = first.updated;
        while updated.is_empty() {
            assert!(Instant::now() < deadline, "poll result never arrived");
            thread::sleep(Duration::from_millis(10));
            updated = h.orchestrator.poll_tick("t").expect("tick").updated;
        }
        assert_eq!(updated, vec!["Q1".to_string()]);
        assert_eq!(
            h.orchestrator.stores().devices.get("Q1").map(|d| d.status),
            Some(DeviceStatus::Online)
        );
        assert!(h.orchestrator.shutdown());
    }

    #[test]
    fn register_and_promote_usb_device() {
        let h = harness();
        h.transport.respond("getprop ro.product.model", OpOutcome::success("Quest 3"));
        h.transport.respond("getprop ro.build.version.release", OpOutcome::success("12"));
        h.transport.respond("get-serialno", OpOutcome::success("2G0YC5ZF9F"));
        h.transport.respond(
            "ip addr show wlan0",
            OpOutcome::success("inet 10.0.0.31/24 brd 10.0.0.255 scope global wlan0"),
        );
        h.transport.respond("tcpip 5555", OpOutcome::success("restarting in TCP mode port: 5555"));
        h.transport
            .connect_result("10.0.0.31:5555", OpOutcome::success("connected to 10.0.0.31:5555"));
        h.transport.set_endpoints(&[("2G0YC5ZF9F", "device")]);

        let device = h
            .orchestrator
            .register_device("2G0YC5ZF9F", Some("Seat 1"), "t")
            .expect("register");
        assert_eq!(device.model, "Quest 3");
        assert_eq!(device.alias, "Seat 1");
        assert_eq!(device.connection_type, ConnectionType::Usb);
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.sort_order, 1);

        let promoted = h.orchestrator.promote_to_wifi("2G0YC5ZF9F", "t").expect("promote");
        assert_eq!(promoted.connection_string(), "10.0.0.31:5555");
        assert_eq!(promoted.connection_type, ConnectionType::Wifi);
        assert_eq!(h.transport.connects(), vec!["10.0.0.31:5555".to_string()]);
    }

    #[test]
    fn unreachable_registration_fails() {
        let h = harness();
        let err = h
            .orchestrator
            .register_device("10.0.0.99:5555", None, "t")
            .expect_err("unreachable");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(h.orchestrator.devices().is_empty());
    }

    #[test]
    fn statistics_follow_registered_devices() {
        let h = harness();
        let mut low = register(&h, "Q1", "10.0.0.1", DeviceStatus::Online);
        low.battery = 12;
        h.orchestrator.stores().devices.save(low, "t").expect("save");
        register(&h, "Q2", "10.0.0.2", DeviceStatus::NotConnected);

        let stats = h.orchestrator.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.low_battery, 1);
        assert_eq!(h.orchestrator.devices().len(), 2);
    }
}
