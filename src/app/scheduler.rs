use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Counting semaphore capping how many transport calls are in flight across batch dispatch
/// and background polling together.
pub struct Semaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> Permit {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            used = self.cv.wait(used).unwrap_or_else(PoisonError::into_inner);
        }
        *used += 1;
        Permit {
            semaphore: Arc::clone(self),
        }
    }

    pub fn in_use(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct Permit {
    semaphore: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Global transport cap plus one lock per device, so dependent calls on the same headset
/// (stop then relaunch, ping then connect) never interleave with another operation on it.
pub struct TaskScheduler {
    global: Arc<Semaphore>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskScheduler {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit)),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire_global(&self) -> Permit {
        self.global.acquire()
    }

    pub fn in_flight(&self) -> usize {
        self.global.in_use()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = self.device_locks.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `work` holding a global permit and the device's lock. A poisoned device lock only
    /// means an earlier operation panicked; the lock itself guards no data.
    pub fn run_exclusive<R>(&self, serial: &str, work: impl FnOnce() -> R) -> R {
        let _permit = self.acquire_global();
        let lock = self.device_lock(serial);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(PoisonError::into_inner);
        work()
    }
}
