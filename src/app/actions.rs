use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::app::adb::transport::Transport;
use crate::app::error::AppError;
use crate::app::models::OpOutcome;
use crate::app::store::{JsonStore, Record};

pub type ActionParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    WakeUp,
    Sleep,
    KeepAwake,
    LaunchApp,
    StopApp,
    RestartApp,
    SendKey,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::WakeUp,
        ActionType::Sleep,
        ActionType::KeepAwake,
        ActionType::LaunchApp,
        ActionType::StopApp,
        ActionType::RestartApp,
        ActionType::SendKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::WakeUp => "wake_up",
            ActionType::Sleep => "sleep",
            ActionType::KeepAwake => "keep_awake",
            ActionType::LaunchApp => "launch_app",
            ActionType::StopApp => "stop_app",
            ActionType::RestartApp => "restart_app",
            ActionType::SendKey => "send_key",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action_type: ActionType,
    #[serde(default)]
    pub params: ActionParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_status: Option<String>,
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

impl Action {
    pub fn new(name: impl Into<String>, action_type: ActionType, params: ActionParams) -> Self {
        let now = Utc::now();
        Self {
            action_id: short_id(),
            name: name.into(),
            description: None,
            action_type,
            params,
            created_at: now,
            updated_at: now,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            last_execution_status: None,
        }
    }

    pub fn record_execution(&mut self, ok: bool, status: impl Into<String>) {
        self.execution_count += 1;
        if ok {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let now = Utc::now();
        self.last_executed_at = Some(now);
        self.last_execution_status = Some(status.into());
        self.updated_at = now;
    }

    /// Percentage of successful runs, 0 when never run.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64 * 100.0
    }
}

impl Record for Action {
    fn record_id(&self) -> &str {
        &self.action_id
    }
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z0-9_]+)+$").expect("valid regex"))
}

fn param_str<'a>(params: &'a ActionParams, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn param_bool(params: &ActionParams, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn param_u64(params: &ActionParams, key: &str) -> Option<u64> {
    let value = params.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

/// Longest pause an action parameter may ask for.
const MAX_DELAY_SECS: f64 = 60.0;

fn param_secs(params: &ActionParams, key: &str, default: f64) -> Duration {
    let secs = params
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs.min(MAX_DELAY_SECS))
}

/// Keycode as sent to `input keyevent`: numbers verbatim, names as given.
fn keycode(params: &ActionParams) -> Option<String> {
    match params.get("keycode")? {
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

fn validate_package(params: &ActionParams) -> Result<(), String> {
    let package = param_str(params, "package").ok_or_else(|| "package is required".to_string())?;
    if !package_re().is_match(&package.to_lowercase()) {
        return Err(format!("Invalid package name: {package} (expected com.example.app)"));
    }
    Ok(())
}

pub fn validate_params(action_type: ActionType, params: &ActionParams) -> Result<(), String> {
    match action_type {
        ActionType::WakeUp | ActionType::Sleep => Ok(()),
        ActionType::KeepAwake => match params.get("mode") {
            None => Ok(()),
            Some(_) => match param_u64(params, "mode") {
                Some(mode) if mode <= 3 => Ok(()),
                _ => Err("mode must be 0, 1, 2 or 3".to_string()),
            },
        },
        ActionType::LaunchApp => {
            validate_package(params)?;
            match param_str(params, "activity") {
                Some(activity) if !activity.starts_with('.') && !activity.contains('.') => {
                    Err(format!(
                        "Invalid activity: {activity} (expected .MainActivity or a full class name)"
                    ))
                }
                _ => Ok(()),
            }
        }
        ActionType::StopApp => validate_package(params),
        ActionType::RestartApp => {
            validate_package(params)?;
            match params.get("delay") {
                None => Ok(()),
                Some(value) => match value.as_f64() {
                    Some(secs) if (0.0..=MAX_DELAY_SECS).contains(&secs) => Ok(()),
                    _ => Err(format!("delay must be between 0 and {MAX_DELAY_SECS} seconds")),
                },
            }
        }
        ActionType::SendKey => keycode(params)
            .map(|_| ())
            .ok_or_else(|| "keycode is required".to_string()),
    }
}

pub fn validate_action(action: &Action) -> Result<(), String> {
    let name_len = action.name.trim().chars().count();
    if name_len == 0 || name_len > 50 {
        return Err("Action name must be 1 to 50 characters".to_string());
    }
    if action
        .description
        .as_deref()
        .map(|text| text.chars().count() > 200)
        .unwrap_or(false)
    {
        return Err("Action description must be at most 200 characters".to_string());
    }
    validate_params(action.action_type, &action.params)
}

/// Pauses between a command and its verification.
#[derive(Debug, Clone, Copy)]
pub struct ActionPacing {
    pub display_settle: Duration,
    pub process_settle: Duration,
    pub key_gap: Duration,
    /// adbd restarts after `tcpip`; connecting earlier is refused.
    pub tcpip_settle: Duration,
}

impl Default for ActionPacing {
    fn default() -> Self {
        Self {
            display_settle: Duration::from_millis(500),
            process_settle: Duration::from_millis(300),
            key_gap: Duration::from_millis(100),
            tcpip_settle: Duration::from_secs(1),
        }
    }
}

impl ActionPacing {
    pub fn immediate() -> Self {
        Self {
            display_settle: Duration::ZERO,
            process_settle: Duration::ZERO,
            key_gap: Duration::ZERO,
            tcpip_settle: Duration::ZERO,
        }
    }
}

pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Runs one action against one target. Each step is a separate remote call issued in order.
pub struct ActionExecutor<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
    pacing: ActionPacing,
    trace_id: &'a str,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        timeout: Duration,
        pacing: ActionPacing,
        trace_id: &'a str,
    ) -> Self {
        Self {
            transport,
            timeout,
            pacing,
            trace_id,
        }
    }

    fn shell(&self, target: &str, command: &str) -> OpOutcome {
        self.transport.execute(target, command, self.timeout, self.trace_id)
    }

    pub fn execute(&self, target: &str, action: &Action) -> OpOutcome {
        if let Err(message) = validate_params(action.action_type, &action.params) {
            return OpOutcome::failure(message);
        }
        info!(
            trace_id = %self.trace_id,
            target = %target,
            action = %action.name,
            action_type = action.action_type.as_str(),
            "executing action"
        );
        let params = &action.params;
        match action.action_type {
            ActionType::WakeUp => self.wake_up(target, params),
            ActionType::Sleep => self.sleep(target, params),
            ActionType::KeepAwake => self.keep_awake(target, params),
            ActionType::LaunchApp => self.launch_app(target, params),
            ActionType::StopApp => self.stop_app(target, params),
            ActionType::RestartApp => self.restart_app(target, params),
            ActionType::SendKey => self.send_key(target, params),
        }
    }

    fn display_state(&self, target: &str) -> Option<String> {
        pause(self.pacing.display_settle);
        let outcome = self.shell(target, "dumpsys power | grep 'Display Power: state='");
        outcome.ok.then_some(outcome.detail)
    }

    fn wake_up(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let sent = self.shell(target, "input keyevent KEYCODE_WAKEUP");
        if !sent.ok {
            return OpOutcome::failure(format!("Wake command failed: {}", sent.detail));
        }
        if !param_bool(params, "verify", true) {
            return OpOutcome::success("Wake command sent");
        }
        match self.display_state(target) {
            Some(state) if state.contains("ON") => OpOutcome::success("Device is awake"),
            _ => {
                warn!(trace_id = %self.trace_id, target = %target, "wake not verified");
                OpOutcome::success("Wake command sent (state not verified)")
            }
        }
    }

    fn sleep(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let key = if param_bool(params, "force", false) {
            "KEYCODE_SLEEP"
        } else {
            "KEYCODE_POWER"
        };
        let sent = self.shell(target, &format!("input keyevent {key}"));
        if !sent.ok {
            return OpOutcome::failure(format!("Sleep command failed: {}", sent.detail));
        }
        if !param_bool(params, "verify", true) {
            return OpOutcome::success("Sleep command sent");
        }
        match self.display_state(target) {
            Some(state) if state.contains("OFF") => OpOutcome::success("Device is asleep"),
            _ => {
                warn!(trace_id = %self.trace_id, target = %target, "sleep not verified");
                OpOutcome::success("Sleep command sent (state not verified)")
            }
        }
    }

    fn keep_awake(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let mode = param_u64(params, "mode").unwrap_or(3);
        let set = self.shell(
            target,
            &format!("settings put global stay_on_while_plugged_in {mode}"),
        );
        if !set.ok {
            return OpOutcome::failure(format!("Keep-awake failed: {}", set.detail));
        }
        let current = self.shell(target, "settings get global stay_on_while_plugged_in");
        if !current.ok {
            return OpOutcome::success("Keep-awake sent (not verified)");
        }
        let value = current.detail.trim();
        if value == mode.to_string() {
            OpOutcome::success(format!("Keep-awake mode set to {mode}"))
        } else {
            warn!(
                trace_id = %self.trace_id,
                target = %target,
                expected = mode,
                actual = %value,
                "keep-awake mismatch"
            );
            OpOutcome::success(format!("Keep-awake sent (current value: {value})"))
        }
    }

    fn launch_app(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let Some(package) = param_str(params, "package") else {
            return OpOutcome::failure("package is required");
        };
        if param_bool(params, "stop_existing", false) {
            let stopped = self.shell(target, &format!("am force-stop {package}"));
            if !stopped.ok {
                warn!(
                    trace_id = %self.trace_id,
                    target = %target,
                    package = %package,
                    "stop before launch failed"
                );
            }
        }
        let command = match param_str(params, "activity") {
            Some(activity) if param_bool(params, "wait", true) => {
                format!("am start -n {package}/{activity} -W")
            }
            Some(activity) => format!("am start -n {package}/{activity}"),
            None => format!("monkey -p {package} 1"),
        };
        let launched = self.shell(target, &command);
        // am and monkey both exit 0 on a failed start.
        if !launched.ok || launched.detail.to_lowercase().contains("error") {
            return OpOutcome::failure(format!("Launch failed: {}", launched.detail));
        }
        OpOutcome::success(format!("Launched {package}"))
    }

    fn stop_app(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let Some(package) = param_str(params, "package") else {
            return OpOutcome::failure("package is required");
        };
        let command = match param_str(params, "method") {
            Some("kill") => format!("am kill {package}"),
            _ => format!("am force-stop {package}"),
        };
        let stopped = self.shell(target, &command);
        if !stopped.ok {
            return OpOutcome::failure(format!("Stop failed: {}", stopped.detail));
        }
        if !param_bool(params, "verify", true) {
            return OpOutcome::success("Stop command sent");
        }
        pause(self.pacing.process_settle);
        let pid = self.shell(target, &format!("pidof {package}"));
        if pid.ok && !pid.detail.trim().is_empty() {
            warn!(
                trace_id = %self.trace_id,
                target = %target,
                package = %package,
                "app still running after stop"
            );
            OpOutcome::success("Stop command sent (app may still be running)")
        } else {
            OpOutcome::success(format!("Stopped {package}"))
        }
    }

    fn restart_app(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let mut stop_params = ActionParams::new();
        if let Some(package) = params.get("package") {
            stop_params.insert("package".to_string(), package.clone());
        }
        let stopped = self.stop_app(target, &stop_params);
        if !stopped.ok {
            return OpOutcome::failure(format!("Restart failed while stopping: {}", stopped.detail));
        }
        pause(param_secs(params, "delay", 1.0));
        let launched = self.launch_app(target, params);
        if !launched.ok {
            return OpOutcome::failure(format!(
                "Restart failed while launching: {}",
                launched.detail
            ));
        }
        OpOutcome::success(format!(
            "Restarted {}",
            param_str(params, "package").unwrap_or_default()
        ))
    }

    fn send_key(&self, target: &str, params: &ActionParams) -> OpOutcome {
        let Some(code) = keycode(params) else {
            return OpOutcome::failure("keycode is required");
        };
        let repeat = param_u64(params, "repeat").unwrap_or(1).max(1);
        for index in 0..repeat {
            let sent = self.shell(target, &format!("input keyevent {code}"));
            if !sent.ok {
                return OpOutcome::failure(format!("Key {code} failed: {}", sent.detail));
            }
            if index + 1 < repeat {
                pause(self.pacing.key_gap);
            }
        }
        OpOutcome::success(format!("Sent key {code} x{repeat}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStatistics {
    pub total_actions: usize,
    pub total_executions: u64,
    pub total_success: u64,
    pub total_failure: u64,
    pub by_type: BTreeMap<String, u64>,
    pub overall_success_rate: f64,
}

pub struct ActionRegistry {
    store: JsonStore<Action>,
}

impl ActionRegistry {
    pub fn open(path: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            store: JsonStore::open(path, trace_id)?,
        })
    }

    pub fn create(
        &self,
        name: &str,
        description: Option<String>,
        action_type: ActionType,
        params: ActionParams,
        trace_id: &str,
    ) -> Result<Action, AppError> {
        let mut action = Action::new(name.trim(), action_type, params);
        action.description = description.filter(|text| !text.trim().is_empty());
        validate_action(&action).map_err(|message| AppError::validation(message, trace_id))?;
        self.store.put(action.clone(), trace_id)?;
        info!(
            trace_id = %trace_id,
            action_id = %action.action_id,
            name = %action.name,
            "action created"
        );
        Ok(action)
    }

    pub fn get(&self, action_id: &str) -> Option<Action> {
        self.store.get(action_id)
    }

    /// Newest first.
    pub fn all(&self) -> Vec<Action> {
        let mut actions = self.store.all();
        actions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.action_id.cmp(&b.action_id))
        });
        actions
    }

    pub fn by_type(&self, action_type: ActionType) -> Vec<Action> {
        self.all()
            .into_iter()
            .filter(|action| action.action_type == action_type)
            .collect()
    }

    pub fn update(&self, mut action: Action, trace_id: &str) -> Result<Action, AppError> {
        if !self.store.contains(&action.action_id) {
            return Err(AppError::not_found(
                format!("Unknown action: {}", action.action_id),
                trace_id,
            ));
        }
        validate_action(&action).map_err(|message| AppError::validation(message, trace_id))?;
        action.updated_at = Utc::now();
        self.store.put(action.clone(), trace_id)?;
        Ok(action)
    }

    pub fn delete(&self, action_id: &str, trace_id: &str) -> Result<bool, AppError> {
        self.store.delete(action_id, trace_id)
    }

    pub fn duplicate(
        &self,
        action_id: &str,
        new_name: Option<&str>,
        trace_id: &str,
    ) -> Result<Action, AppError> {
        let original = self
            .get(action_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown action: {action_id}"), trace_id))?;
        let name = match new_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{} (copy)", original.name),
        };
        self.create(
            &name,
            original.description.clone(),
            original.action_type,
            original.params,
            trace_id,
        )
    }

    /// Case-insensitive match on name or description.
    pub fn search(&self, keyword: &str) -> Vec<Action> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return self.all();
        }
        self.all()
            .into_iter()
            .filter(|action| {
                action.name.to_lowercase().contains(&needle)
                    || action
                        .description
                        .as_deref()
                        .map(|text| text.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Folds a batch run into the action's counters: one execution per target.
    pub fn record_execution(
        &self,
        action_id: &str,
        results: &[bool],
        trace_id: &str,
    ) -> Result<(), AppError> {
        let Some(mut action) = self.get(action_id) else {
            return Err(AppError::not_found(format!("Unknown action: {action_id}"), trace_id));
        };
        for ok in results {
            action.record_execution(*ok, if *ok { "success" } else { "failed" });
        }
        self.store.put(action, trace_id)
    }

    pub fn statistics(&self) -> ActionStatistics {
        let actions = self.store.all();
        let mut stats = ActionStatistics {
            total_actions: actions.len(),
            ..ActionStatistics::default()
        };
        for action in &actions {
            stats.total_executions += action.execution_count;
            stats.total_success += action.success_count;
            stats.total_failure += action.failure_count;
            *stats.by_type.entry(action.action_type.as_str().to_string()).or_default() += 1;
        }
        if stats.total_executions > 0 {
            stats.overall_success_rate =
                stats.total_success as f64 / stats.total_executions as f64 * 100.0;
        }
        stats
    }
}
