#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_module::{
    DedupStore, Dispatcher, FileJobStore, JobResultStore, Scheduler, SendLog, SendLogEntry,
};

/// Start a mockito server, skipping gracefully in environments where
/// binding a local listener is not allowed.
pub fn start_mockito_server(test_name: &str) -> Option<mockito::ServerGuard> {
    let server = std::panic::catch_unwind(mockito::Server::new);
    match server {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!("Skipping {test_name}; unable to start mockito server in this environment.");
            None
        }
    }
}

pub fn temp_send_log(dir: &Path) -> SendLog {
    SendLog::new(dir.join("send_log.jsonl"))
}

pub fn temp_dispatcher(dir: &Path) -> Dispatcher {
    Dispatcher::new(
        temp_send_log(dir),
        Arc::new(DedupStore::new(dir.join("send_dedup.json"))),
    )
}

pub fn temp_scheduler(dir: &Path, interval: Duration) -> Scheduler {
    Scheduler::new(
        Arc::new(FileJobStore::new(dir.join("scheduler_store.json"))),
        Arc::new(temp_dispatcher(dir)),
        Arc::new(JobResultStore::new(dir.join("send_results.json"))),
        interval,
    )
}

pub fn read_log_entries(dir: &Path) -> Vec<SendLogEntry> {
    let path = dir.join("send_log.jsonl");
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Append a successful send entry directly, for seeding usage history.
pub fn seed_success(log: &SendLog, provider: &str, recipient: &str, age: chrono::Duration) {
    log.append(SendLogEntry {
        timestamp: Utc::now() - age,
        job_id: String::new(),
        step: String::new(),
        attempt: 1,
        provider: provider.to_string(),
        success: true,
        error: String::new(),
        recipients: vec![recipient.to_string()],
    });
}
