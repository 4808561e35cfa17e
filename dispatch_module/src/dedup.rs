//! Persistent dedup fingerprints for `schedule_mode = once` sends.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use mailer_module::{Message, ScheduleMode};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::dispatch::SendContext;

pub const DEFAULT_DEDUP_FILE: &str = "send_dedup.json";

/// Map of dedup key to first-marked timestamp. Coarse mutex, lazy load,
/// rewrite on mark; no eviction.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, DateTime<Utc>>>>,
}

impl DedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|err| err.into_inner());
        self.loaded(&mut cache).contains_key(key)
    }

    pub fn mark(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|err| err.into_inner());
        let map = self.loaded(&mut cache);
        map.insert(key.to_string(), Utc::now());
        let encoded = match serde_json::to_string_pretty(&map) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "dedup: cannot encode store");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, encoded) {
            warn!(path = %self.path.display(), error = %err, "dedup: cannot write store");
        }
    }

    fn loaded<'a>(
        &self,
        cache: &'a mut Option<HashMap<String, DateTime<Utc>>>,
    ) -> &'a mut HashMap<String, DateTime<Utc>> {
        if cache.is_none() {
            let map = match fs::read(&self.path) {
                Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                    warn!(error = %err, "dedup: cannot decode store");
                    HashMap::new()
                }),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => {
                    warn!(error = %err, "dedup: cannot read store");
                    HashMap::new()
                }
            };
            *cache = Some(map);
        }
        cache.as_mut().expect("cache populated above")
    }
}

/// Deterministic fingerprint of (recipients, step, subject, body). Only
/// produced when the schedule mode is not `repeat`.
pub fn dedup_key(msg: &Message, ctx: Option<&SendContext>) -> Option<String> {
    if msg.schedule_mode == ScheduleMode::Repeat {
        return None;
    }
    let step = ctx
        .map(|ctx| ctx.step.trim().to_string())
        .filter(|step| !step.is_empty())
        .or_else(|| {
            msg.additional_data
                .get("step")
                .and_then(|value| value.as_str())
                .map(|step| step.trim().to_string())
        })
        .unwrap_or_default();
    let recipients = msg.to.join(",").to_lowercase();
    let subject_hash = sha256_hex(msg.subject.trim().to_lowercase().as_bytes());
    let body = format!("{}{}{}", msg.body, msg.text_body, msg.html_body);
    let body_hash = sha256_hex(body.trim().to_lowercase().as_bytes());
    Some(format!(
        "{recipients}|{}|{subject_hash}|{body_hash}",
        step.to_lowercase()
    ))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
