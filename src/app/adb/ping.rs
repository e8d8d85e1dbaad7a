use std::time::Duration;

use tracing::debug;

use crate::app::adb::parse::parse_ping_rtt;
use crate::app::adb::runner::run_command_with_timeout;

/// ICMP reachability check for a device host.
pub trait Pinger: Send + Sync {
    /// Round trip in milliseconds, or `None` when the host did not answer in time.
    fn ping(&self, host: &str, timeout: Duration, trace_id: &str) -> Option<f64>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemPinger;

pub fn build_ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1);
    if cfg!(windows) {
        vec![
            "-n".to_string(),
            "1".to_string(),
            "-w".to_string(),
            (secs * 1000).to_string(),
            host.to_string(),
        ]
    } else if cfg!(target_os = "macos") {
        // BSD ping takes the wait in milliseconds.
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            (secs * 1000).to_string(),
            host.to_string(),
        ]
    } else {
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            secs.to_string(),
            host.to_string(),
        ]
    }
}

impl Pinger for SystemPinger {
    fn ping(&self, host: &str, timeout: Duration, trace_id: &str) -> Option<f64> {
        let args = build_ping_args(host, timeout);
        // The process gets a grace second on top of its own wait.
        let grace = timeout + Duration::from_secs(1);
        let output = match run_command_with_timeout("ping", &args, grace, trace_id) {
            Ok(output) => output,
            Err(err) => {
                debug!(trace_id = %trace_id, host = %host, error = %err, "ping did not complete");
                return None;
            }
        };
        if !output.succeeded() {
            return None;
        }
        // Some platforms print no time for sub-millisecond replies.
        Some(parse_ping_rtt(&output.stdout).unwrap_or(0.0))
    }
}
