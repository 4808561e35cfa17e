//! Durable scheduled-job storage: a single JSON document holding the whole
//! job array, reloaded and rewritten under one mutex per mutation. Fine for
//! single-process operation; swap in a database behind [`JobStore`] without
//! touching the scheduler.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use mailer_module::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

pub const DEFAULT_STORE_FILE: &str = "scheduler_store.json";

/// A persisted unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub message: Message,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

pub trait JobStore: Send + Sync {
    fn add(&self, job: &ScheduledJob) -> Result<(), StoreError>;
    /// Replace the stored job with the same id; errors if it is absent.
    fn update(&self, job: &ScheduledJob) -> Result<(), StoreError>;
    /// Remove the job with this id; errors if it is absent.
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Jobs with `run_at <= before`, ascending by `run_at`.
    fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;
    fn list_all(&self) -> Result<Vec<ScheduledJob>, StoreError>;
}

pub struct FileJobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_locked(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        match fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist_locked(&self, jobs: &[ScheduledJob]) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(jobs)?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }

    /// Load-mutate-rewrite under the store mutex.
    fn mutate<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<ScheduledJob>) -> Result<(), StoreError>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut jobs = self.load_locked()?;
        f(&mut jobs)?;
        self.persist_locked(&jobs)
    }
}

impl JobStore for FileJobStore {
    fn add(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.mutate(move |jobs| {
            jobs.push(job);
            jobs.sort_by_key(|j| j.run_at);
            Ok(())
        })
    }

    fn update(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.mutate(move |jobs| {
            match jobs.iter_mut().find(|existing| existing.id == job.id) {
                Some(existing) => {
                    *existing = job;
                    Ok(())
                }
                None => Err(StoreError::JobNotFound(job.id.clone())),
            }
        })
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.mutate(move |jobs| {
            match jobs.iter().position(|job| job.id == id) {
                Some(index) => {
                    jobs.remove(index);
                    Ok(())
                }
                None => Err(StoreError::JobNotFound(id)),
            }
        })
    }

    fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut due: Vec<ScheduledJob> = self
            .list_all()?
            .into_iter()
            .filter(|job| job.run_at <= before)
            .collect();
        due.sort_by_key(|job| job.run_at);
        Ok(due)
    }

    fn list_all(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|err| err.into_inner());
        self.load_locked()
    }
}
