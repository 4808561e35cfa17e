//! Terminal job outcomes, persisted as a small JSON object keyed by job id.
//! Dependent workflow steps consult this map to decide whether to run.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_RESULTS_FILE: &str = "send_results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failed,
    Skipped,
    Blocked,
}

/// Lazy-loaded, mutex-guarded map of job id to terminal result. Writes are
/// best-effort: persistence failures are logged, the in-memory view stays
/// authoritative for this process.
#[derive(Debug)]
pub struct JobResultStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, JobResult>>>,
}

impl JobResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn record(&self, job_id: &str, result: JobResult) {
        if job_id.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|err| err.into_inner());
        let map = self.loaded(&mut cache);
        map.insert(job_id.to_string(), result);
        let encoded = match serde_json::to_string_pretty(&map) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "results: cannot encode store");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, encoded) {
            warn!(path = %self.path.display(), error = %err, "results: cannot write store");
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobResult> {
        if job_id.is_empty() {
            return None;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|err| err.into_inner());
        self.loaded(&mut cache).get(job_id).copied()
    }

    fn loaded<'a>(
        &self,
        cache: &'a mut Option<HashMap<String, JobResult>>,
    ) -> &'a mut HashMap<String, JobResult> {
        if cache.is_none() {
            let map = match fs::read(&self.path) {
                Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                    warn!(error = %err, "results: cannot decode store");
                    HashMap::new()
                }),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => {
                    warn!(error = %err, "results: cannot read store");
                    HashMap::new()
                }
            };
            *cache = Some(map);
        }
        cache.as_mut().expect("cache populated above")
    }
}
