use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::app::error::AppError;

/// A document stored under a stable string key.
pub trait Record: Serialize + DeserializeOwned + Clone + Send {
    fn record_id(&self) -> &str;
}

/// JSON file holding one kind of record, keyed by id. Every write rewrites the whole file;
/// concurrent writers are last-write-wins.
pub struct JsonStore<R: Record> {
    path: PathBuf,
    records: Mutex<BTreeMap<String, R>>,
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    path.with_file_name(format!("{stem}.backup.json"))
}

impl<R: Record> JsonStore<R> {
    pub fn open(path: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        let path = path.into();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|err| {
                AppError::system(format!("Failed to read {}: {err}", path.display()), trace_id)
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<BTreeMap<String, R>>(&raw).map_err(|err| {
                    let message = format!("Failed to parse {}: {err}", path.display());
                    AppError::validation(message, trace_id)
                })?
            }
        } else {
            BTreeMap::new()
        };
        debug!(trace_id = %trace_id, path = %path.display(), count = records.len(), "store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, R>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.records().get(id).cloned()
    }

    pub fn all(&self) -> Vec<R> {
        self.records().values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records().contains_key(id)
    }

    pub fn put(&self, record: R, trace_id: &str) -> Result<(), AppError> {
        self.put_many(std::iter::once(record), trace_id)
    }

    /// Writes several records with a single flush. Memory only changes once the file does.
    pub fn put_many(
        &self,
        records: impl IntoIterator<Item = R>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let mut guard = self.records();
        let mut next = guard.clone();
        for record in records {
            next.insert(record.record_id().to_string(), record);
        }
        self.flush(&next, trace_id)?;
        *guard = next;
        Ok(())
    }

    pub fn delete(&self, id: &str, trace_id: &str) -> Result<bool, AppError> {
        let mut guard = self.records();
        if !guard.contains_key(id) {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.remove(id);
        self.flush(&next, trace_id)?;
        *guard = next;
        Ok(true)
    }

    fn flush(&self, records: &BTreeMap<String, R>, trace_id: &str) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create {}: {err}", parent.display()), trace_id)
            })?;
        }
        if self.path.exists() {
            if let Err(err) = fs::copy(&self.path, backup_path(&self.path)) {
                warn!(
                    trace_id = %trace_id,
                    path = %self.path.display(),
                    error = %err,
                    "store backup failed"
                );
            }
        }
        let payload = serde_json::to_string_pretty(records).map_err(|err| {
            AppError::system(format!("Failed to serialize records: {err}"), trace_id)
        })?;
        fs::write(&self.path, payload).map_err(|err| {
            AppError::system(format!("Failed to write {}: {err}", self.path.display()), trace_id)
        })
    }
}
