use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::app::adb::ping::Pinger;
use crate::app::adb::transport::Transport;
use crate::app::autoconnect::check_and_auto_connect;
use crate::app::config::NetworkSettings;
use crate::app::dispatch::panic_message;
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceStatus, PingOutcome};
use crate::app::reconcile::Reconciler;
use crate::app::retry::RetryPolicy;
use crate::app::scheduler::TaskScheduler;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LiveWorkers {
    count: Mutex<usize>,
    idle: Condvar,
}

struct LiveGuard(Arc<LiveWorkers>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.0.count);
        *count = count.saturating_sub(1);
        self.0.idle.notify_all();
    }
}

/// Fixed set of named threads fed from one job queue. Lives as long as its owner.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<LiveWorkers>,
}

impl WorkerPool {
    pub fn new(size: usize, name_prefix: &str, trace_id: &str) -> Result<Self, AppError> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let live = Arc::new(LiveWorkers {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            *lock(&live.count) += 1;
            let guard = LiveGuard(Arc::clone(&live));
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-{index}"))
                .spawn(move || {
                    let _guard = guard;
                    loop {
                        let next = lock(&receiver).recv();
                        let Ok(job) = next else {
                            break;
                        };
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                            warn!(error = %panic_message(payload.as_ref()), "pool job panicked");
                        }
                    }
                })
                .map_err(|err| {
                    AppError::system(format!("Failed to start worker thread: {err}"), trace_id)
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            live,
        })
    }

    pub fn execute(
        &self,
        job: impl FnOnce() + Send + 'static,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let guard = lock(&self.sender);
        let Some(sender) = guard.as_ref() else {
            return Err(AppError::validation("Worker pool is shut down", trace_id));
        };
        sender
            .send(Box::new(job))
            .map_err(|_| AppError::system("Worker pool is not accepting jobs", trace_id))
    }

    pub fn is_running(&self) -> bool {
        lock(&self.sender).is_some()
    }

    /// Stops accepting jobs and waits up to `timeout` for queued ones to drain. Returns false
    /// when workers were still busy; those threads are left to finish on their own.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        drop(lock(&self.sender).take());
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.live.count);
        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(busy = *count, "worker pool shutdown timed out");
                return false;
            }
            let (next, _) = self
                .live
                .idle
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            count = next;
        }
        drop(count);
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    submitted_at: Instant,
    done: bool,
}

#[derive(Debug, Clone)]
struct CachedResult {
    outcome: PingOutcome,
    completed_at: Instant,
    applied: bool,
}

/// Background reachability checks with at most one check in flight per device.
///
/// `submit` and `collect` never wait on a check; results land in a cache that `collect`
/// folds into the device records.
pub struct PollService {
    pool: WorkerPool,
    transport: Arc<dyn Transport>,
    pinger: Arc<dyn Pinger>,
    retries: Arc<RetryPolicy>,
    scheduler: Arc<TaskScheduler>,
    in_flight: Arc<Mutex<HashMap<String, Slot>>>,
    results: Arc<Mutex<HashMap<String, CachedResult>>>,
    max_age: Duration,
}

impl PollService {
    pub fn new(
        workers: usize,
        max_age: Duration,
        transport: Arc<dyn Transport>,
        pinger: Arc<dyn Pinger>,
        retries: Arc<RetryPolicy>,
        scheduler: Arc<TaskScheduler>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        Ok(Self {
            pool: WorkerPool::new(workers, "fleet-ping", trace_id)?,
            transport,
            pinger,
            retries,
            scheduler,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
            max_age,
        })
    }

    /// Queues a check for every device without one in flight. Returns how many were queued.
    pub fn submit(
        &self,
        devices: &[&Device],
        network: &NetworkSettings,
        trace_id: &str,
    ) -> Result<usize, AppError> {
        let mut queued = 0;
        for device in devices {
            let serial = device.serial.clone();
            {
                let mut in_flight = lock(&self.in_flight);
                if in_flight.get(&serial).map(|slot| !slot.done).unwrap_or(false) {
                    debug!(trace_id = %trace_id, serial = %serial, "check already in flight");
                    continue;
                }
                in_flight.insert(
                    serial.clone(),
                    Slot {
                        submitted_at: Instant::now(),
                        done: false,
                    },
                );
            }

            let device = (*device).clone();
            let network = network.clone();
            let transport = Arc::clone(&self.transport);
            let pinger = Arc::clone(&self.pinger);
            let retries = Arc::clone(&self.retries);
            let scheduler = Arc::clone(&self.scheduler);
            let in_flight = Arc::clone(&self.in_flight);
            let results = Arc::clone(&self.results);
            let job_trace = trace_id.to_string();

            let submitted = self.pool.execute(
                move || {
                    let checked = catch_unwind(AssertUnwindSafe(|| {
                        scheduler.run_exclusive(&device.serial, || {
                            check_and_auto_connect(
                                &device,
                                transport.as_ref(),
                                pinger.as_ref(),
                                &network,
                                &retries,
                                &job_trace,
                            )
                        })
                    }));
                    let outcome = checked.unwrap_or_else(|payload| PingOutcome {
                        status: None,
                        message: panic_message(payload.as_ref()),
                        ping_ms: None,
                    });
                    debug!(
                        trace_id = %job_trace,
                        serial = %device.serial,
                        status = ?outcome.status,
                        ping_ms = ?outcome.ping_ms,
                        "check finished"
                    );
                    lock(&results).insert(
                        device.serial.clone(),
                        CachedResult {
                            outcome,
                            completed_at: Instant::now(),
                            applied: false,
                        },
                    );
                    if let Some(slot) = lock(&in_flight).get_mut(&device.serial) {
                        slot.done = true;
                    }
                },
                trace_id,
            );
            if let Err(err) = submitted {
                lock(&self.in_flight).remove(&serial);
                return Err(err);
            }
            queued += 1;
        }
        Ok(queued)
    }

    /// Folds finished checks into `devices` and returns copies of the records that changed.
    /// Each result is applied at most once; results past the max age, or older than the
    /// device's latest status transition, are skipped.
    pub fn collect(&self, devices: &mut [Device], reconciler: &Reconciler) -> Vec<Device> {
        let now = Instant::now();
        let mut updated = Vec::new();

        for device in devices.iter_mut() {
            {
                let mut in_flight = lock(&self.in_flight);
                if in_flight.get(&device.serial).map(|slot| slot.done).unwrap_or(false) {
                    in_flight.remove(&device.serial);
                }
            }

            let pending = {
                let mut results = lock(&self.results);
                match results.get_mut(&device.serial) {
                    Some(cached) if !cached.applied => {
                        cached.applied = true;
                        Some(cached.clone())
                    }
                    _ => None,
                }
            };
            let Some(cached) = pending else {
                continue;
            };
            if now.saturating_duration_since(cached.completed_at) >= self.max_age {
                debug!(serial = %device.serial, "dropping expired check result");
                continue;
            }
            if reconciler.is_stale(&device.serial, cached.completed_at) {
                debug!(serial = %device.serial, "dropping check result older than last transition");
                continue;
            }

            let mut changed = false;
            if let Some(status) = cached.outcome.status {
                if reconciler.apply_status_at(device, status, now).is_some() {
                    changed = true;
                } else if status == DeviceStatus::Online {
                    device.last_seen = Some(Utc::now());
                    changed = true;
                }
            }
            if cached.outcome.ping_ms.is_some() && device.ping_ms != cached.outcome.ping_ms {
                device.ping_ms = cached.outcome.ping_ms;
                changed = true;
            }
            if changed {
                updated.push(device.clone());
            }
        }
        updated
    }

    /// Latest cached result for `serial`, applied or not.
    pub fn cached_result(&self, serial: &str) -> Option<PingOutcome> {
        lock(&self.results).get(serial).map(|cached| cached.outcome.clone())
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).values().filter(|slot| !slot.done).count()
    }

    /// Age of the oldest check still running, for diagnostics.
    pub fn oldest_in_flight(&self) -> Option<Duration> {
        lock(&self.in_flight)
            .values()
            .filter(|slot| !slot.done)
            .map(|slot| slot.submitted_at.elapsed())
            .max()
    }

    pub fn cleanup_old_results(&self, max_age: Duration) -> usize {
        let mut results = lock(&self.results);
        let before = results.len();
        results.retain(|_, cached| cached.completed_at.elapsed() <= max_age);
        let removed = before - results.len();
        if removed > 0 {
            debug!(removed, "expired check results dropped");
        }
        removed
    }

    pub fn shutdown(&self, timeout: Duration) -> bool {
        let clean = self.pool.shutdown(timeout);
        info!(clean, "poll service stopped");
        clean
    }
}
