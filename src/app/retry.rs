use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RetryState {
    count: u32,
    last_attempt: Option<Instant>,
}

/// Per-device reconnect bookkeeping. Process-local; unknown ids behave as zero retries with
/// no cooldown. The retry cap is the caller's business.
#[derive(Debug, Default)]
pub struct RetryPolicy {
    states: Mutex<HashMap<String, RetryState>>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn should_attempt(&self, device_id: &str, cooldown: Duration) -> bool {
        self.should_attempt_at(device_id, cooldown, Instant::now())
    }

    pub fn should_attempt_at(&self, device_id: &str, cooldown: Duration, now: Instant) -> bool {
        let last_attempt = self.states().get(device_id).and_then(|state| state.last_attempt);
        match last_attempt {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < cooldown {
                    debug!(
                        device_id = %device_id,
                        remaining_secs = (cooldown - elapsed).as_secs(),
                        "auto-connect cooling down"
                    );
                    return false;
                }
                true
            }
            None => true,
        }
    }

    pub fn record_failure(&self, device_id: &str) -> u32 {
        self.record_failure_at(device_id, Instant::now())
    }

    /// Bumps the counter and opens a new cooldown window. Returns the new count.
    pub fn record_failure_at(&self, device_id: &str, now: Instant) -> u32 {
        let mut states = self.states();
        let state = states.entry(device_id.to_string()).or_default();
        state.count = state.count.saturating_add(1);
        state.last_attempt = Some(now);
        debug!(device_id = %device_id, retries = state.count, "auto-connect failure recorded");
        state.count
    }

    pub fn record_success(&self, device_id: &str) {
        self.states().remove(device_id);
    }

    pub fn retry_count(&self, device_id: &str) -> u32 {
        self.states().get(device_id).map(|state| state.count).unwrap_or(0)
    }

    pub fn is_exhausted(&self, device_id: &str, max_retries: u32) -> bool {
        self.retry_count(device_id) >= max_retries
    }
}
