use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::locator::{resolve_adb_program, validate_program};
use crate::app::adb::parse::{connect_succeeded, parse_adb_devices};
use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::config::AdbSettings;
use crate::app::error::AppError;
use crate::app::models::{LiveEndpoint, OpOutcome};

/// Remote command bridge to the headsets. Calls are synchronous and enforce their own timeout.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &str, trace_id: &str) -> OpOutcome;

    fn disconnect(&self, target: &str, trace_id: &str) -> OpOutcome;

    /// Runs `command` in the remote shell of `target`.
    fn execute(&self, target: &str, command: &str, timeout: Duration, trace_id: &str) -> OpOutcome;

    fn list_live_endpoints(&self, trace_id: &str) -> Result<Vec<LiveEndpoint>, AppError>;

    /// Host-side call scoped to one target (`tcpip`, `get-serialno`, ...).
    fn host_command(
        &self,
        target: &str,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> OpOutcome;
}

pub struct AdbTransport {
    program: String,
    default_timeout: Duration,
}

impl AdbTransport {
    pub fn new(settings: &AdbSettings, trace_id: &str) -> Result<Self, AppError> {
        let program = resolve_adb_program(&settings.command_path);
        validate_program(&program, "ADB")
            .map_err(|message| AppError::validation(message, trace_id))?;
        Ok(Self {
            program,
            default_timeout: Duration::from_secs(settings.connection_timeout_secs.max(1)),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn run(
        &self,
        args: Vec<String>,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&self.program, &args, timeout, trace_id)
    }

    pub fn version(&self, trace_id: &str) -> Result<String, AppError> {
        let output = self.run(vec!["version".to_string()], Duration::from_secs(5), trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb version failed: {}", output.detail()),
                trace_id,
            ));
        }
        Ok(output.stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

fn outcome_from(result: Result<CommandOutput, AppError>) -> OpOutcome {
    match result {
        Ok(output) if output.succeeded() => OpOutcome::success(output.detail()),
        Ok(output) => OpOutcome::failure(output.detail()),
        Err(err) => OpOutcome::failure(err.error),
    }
}

impl Transport for AdbTransport {
    fn connect(&self, address: &str, trace_id: &str) -> OpOutcome {
        let args = vec!["connect".to_string(), address.to_string()];
        match self.run(args, self.default_timeout, trace_id) {
            Ok(output) => {
                let combined = format!("{}{}", output.stdout, output.stderr);
                if output.succeeded() && connect_succeeded(&combined) {
                    debug!(trace_id = %trace_id, address = %address, "adb connect ok");
                    OpOutcome::success(combined.trim())
                } else {
                    warn!(
                        trace_id = %trace_id,
                        address = %address,
                        detail = %combined.trim(),
                        "adb connect failed"
                    );
                    OpOutcome::failure(combined.trim())
                }
            }
            Err(err) => {
                warn!(trace_id = %trace_id, address = %address, error = %err, "adb connect failed");
                OpOutcome::failure(err.error)
            }
        }
    }

    fn disconnect(&self, target: &str, trace_id: &str) -> OpOutcome {
        let args = vec!["disconnect".to_string(), target.to_string()];
        outcome_from(self.run(args, self.default_timeout, trace_id))
    }

    fn execute(&self, target: &str, command: &str, timeout: Duration, trace_id: &str) -> OpOutcome {
        let args = vec![
            "-s".to_string(),
            target.to_string(),
            "shell".to_string(),
            command.to_string(),
        ];
        outcome_from(self.run(args, timeout, trace_id))
    }

    fn list_live_endpoints(&self, trace_id: &str) -> Result<Vec<LiveEndpoint>, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output = self.run(args, self.default_timeout, trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb devices failed: {}", output.detail()),
                trace_id,
            ));
        }
        Ok(parse_adb_devices(&output.stdout))
    }

    fn host_command(
        &self,
        target: &str,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> OpOutcome {
        let mut full = vec!["-s".to_string(), target.to_string()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        outcome_from(self.run(full, timeout, trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_explicit_program() {
        let settings = AdbSettings {
            command_path: "/this/path/should/not/exist/adb".to_string(),
            ..AdbSettings::default()
        };
        let err = AdbTransport::new(&settings, "trace-1").err().expect("expected error");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(err.trace_id, "trace-1");
    }

    #[test]
    fn defaults_to_path_lookup() {
        let transport = AdbTransport::new(&AdbSettings::default(), "trace").expect("transport");
        assert_eq!(transport.program(), "adb");
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failures_become_failed_outcomes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = dir.path().join("adb");
        std::fs::write(&fake, "not executable").expect("write");
        let settings = AdbSettings {
            command_path: fake.to_string_lossy().to_string(),
            ..AdbSettings::default()
        };
        let transport = AdbTransport::new(&settings, "trace").expect("transport");
        let outcome = transport.execute("A", "true", Duration::from_secs(1), "trace");
        assert!(!outcome.ok);
        assert!(!outcome.detail.is_empty());
    }
}
