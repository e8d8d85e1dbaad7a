use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::models::{BatchItem, OpOutcome};

/// Called on the dispatching thread after every completion with `(done, total)`.
pub type ProgressFn<'a> = &'a dyn Fn(usize, usize);

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}

/// Runs `op` once per target on at most `max_workers` threads.
///
/// Every target yields exactly one [`BatchItem`], in completion order. A panicking `op` is
/// reported as a failed item carrying the panic text; a panicking progress callback is logged
/// and ignored. The only error is a rejected worker count, raised before any work starts.
pub fn dispatch<T, F>(
    targets: Vec<T>,
    op: F,
    max_workers: usize,
    on_progress: Option<ProgressFn<'_>>,
    trace_id: &str,
) -> Result<Vec<BatchItem<T>>, AppError>
where
    T: Send,
    F: Fn(&T) -> OpOutcome + Sync,
{
    if max_workers == 0 {
        return Err(AppError::validation("max_workers must be at least 1", trace_id));
    }
    let total = targets.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let workers = max_workers.min(total);
    debug!(trace_id = %trace_id, total, workers, "dispatch start");

    let queue = Mutex::new(targets.into_iter().collect::<VecDeque<T>>());
    let (tx, rx) = mpsc::channel::<BatchItem<T>>();
    let mut results = Vec::with_capacity(total);

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let op = &op;
            scope.spawn(move || loop {
                let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                let Some(target) = next else {
                    break;
                };
                let outcome = match catch_unwind(AssertUnwindSafe(|| op(&target))) {
                    Ok(outcome) => outcome,
                    Err(payload) => OpOutcome::failure(panic_message(payload.as_ref())),
                };
                let item = BatchItem {
                    target,
                    ok: outcome.ok,
                    detail: outcome.detail,
                };
                if tx.send(item).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for item in rx.iter() {
            results.push(item);
            if let Some(callback) = on_progress {
                let done = results.len();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(done, total))) {
                    warn!(
                        trace_id = %trace_id,
                        error = %panic_message(payload.as_ref()),
                        "progress callback failed"
                    );
                }
            }
        }
    });

    let succeeded = results.iter().filter(|item| item.ok).count();
    info!(
        trace_id = %trace_id,
        total,
        succeeded,
        failed = total - succeeded,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dispatch finished"
    );
    Ok(results)
}
