//! In-memory stand-ins for the external collaborators, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::app::adb::ping::Pinger;
use crate::app::adb::scrcpy::{MirrorOptions, ScreenLauncher};
use crate::app::adb::transport::Transport;
use crate::app::error::AppError;
use crate::app::models::{EndpointState, LiveEndpoint, OpOutcome};

#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, OpOutcome>>,
    target_responses: Mutex<HashMap<(String, String), OpOutcome>>,
    connect_results: Mutex<HashMap<String, OpOutcome>>,
    endpoints: Mutex<Vec<LiveEndpoint>>,
    listing_error: Mutex<Option<String>>,
    executed: Mutex<Vec<(String, String)>>,
    connects: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    running: AtomicUsize,
    high_water: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply for `command` on every target (shell command or joined host-command args).
    pub fn respond(&self, command: &str, outcome: OpOutcome) {
        self.responses.lock().unwrap().insert(command.to_string(), outcome);
    }

    pub fn respond_for(&self, target: &str, command: &str, outcome: OpOutcome) {
        self.target_responses
            .lock()
            .unwrap()
            .insert((target.to_string(), command.to_string()), outcome);
    }

    pub fn connect_result(&self, address: &str, outcome: OpOutcome) {
        self.connect_results.lock().unwrap().insert(address.to_string(), outcome);
    }

    pub fn set_endpoints(&self, endpoints: &[(&str, &str)]) {
        *self.endpoints.lock().unwrap() = endpoints
            .iter()
            .map(|(address, state)| {
                LiveEndpoint::new(*address, EndpointState::from_reported(state))
            })
            .collect();
    }

    pub fn fail_listing(&self, message: &str) {
        *self.listing_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn commands_for(&self, target: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|(seen, _)| seen == target)
            .map(|(_, command)| command)
            .collect()
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    fn reply(&self, target: &str, command: &str) -> OpOutcome {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.executed
            .lock()
            .unwrap()
            .push((target.to_string(), command.to_string()));
        let specific = self
            .target_responses
            .lock()
            .unwrap()
            .get(&(target.to_string(), command.to_string()))
            .cloned();
        let outcome = specific
            .or_else(|| self.responses.lock().unwrap().get(command).cloned())
            .unwrap_or_else(|| OpOutcome::failure(format!("no scripted reply for {command}")));
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl Transport for FakeTransport {
    fn connect(&self, address: &str, _trace_id: &str) -> OpOutcome {
        self.connects.lock().unwrap().push(address.to_string());
        let outcome = self
            .connect_results
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_else(|| OpOutcome::failure(format!("failed to connect to {address}")));
        if outcome.ok {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints.retain(|endpoint| endpoint.address != address);
            endpoints.push(LiveEndpoint::new(address, EndpointState::Ready));
        }
        outcome
    }

    fn disconnect(&self, target: &str, _trace_id: &str) -> OpOutcome {
        self.endpoints
            .lock()
            .unwrap()
            .retain(|endpoint| endpoint.address != target);
        OpOutcome::success(format!("disconnected {target}"))
    }

    fn execute(
        &self,
        target: &str,
        command: &str,
        _timeout: Duration,
        _trace_id: &str,
    ) -> OpOutcome {
        self.reply(target, command)
    }

    fn list_live_endpoints(&self, trace_id: &str) -> Result<Vec<LiveEndpoint>, AppError> {
        if let Some(message) = self.listing_error.lock().unwrap().clone() {
            return Err(AppError::dependency(message, trace_id));
        }
        Ok(self.endpoints.lock().unwrap().clone())
    }

    fn host_command(
        &self,
        target: &str,
        args: &[&str],
        _timeout: Duration,
        _trace_id: &str,
    ) -> OpOutcome {
        self.reply(target, &args.join(" "))
    }
}

#[derive(Default)]
pub struct FakePinger {
    reachable: Mutex<HashMap<String, f64>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakePinger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(&self, host: &str, rtt_ms: f64) {
        self.reachable.lock().unwrap().insert(host.to_string(), rtt_ms);
    }

    pub fn unreachable(&self, host: &str) {
        self.reachable.lock().unwrap().remove(host);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Pinger for FakePinger {
    fn ping(&self, host: &str, _timeout: Duration, _trace_id: &str) -> Option<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.reachable.lock().unwrap().get(host).copied()
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
    missing: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, target: &str) {
        self.failing.lock().unwrap().insert(target.to_string());
    }

    pub fn launches(&self) -> Vec<(String, String)> {
        self.launches.lock().unwrap().clone()
    }

    pub fn uninstall(&self) {
        self.missing.store(true, Ordering::SeqCst);
    }
}

impl ScreenLauncher for FakeLauncher {
    fn check_available(&self) -> Option<String> {
        if self.missing.load(Ordering::SeqCst) {
            None
        } else {
            Some("scrcpy 2.4".to_string())
        }
    }

    fn launch(&self, target: &str, title: &str, _options: &MirrorOptions) -> OpOutcome {
        self.launches
            .lock()
            .unwrap()
            .push((target.to_string(), title.to_string()));
        if self.failing.lock().unwrap().contains(target) {
            OpOutcome::failure("scrcpy exited immediately")
        } else {
            OpOutcome::success("Mirror window launched")
        }
    }
}
