//! Append-only send log plus the usage oracle that scores providers over
//! it. One JSON line per attempt; readers scan from the start and skip
//! malformed lines so rotation or truncation can only lose history, never
//! corrupt selection.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailer_module::{extract_domain, Message};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatch::SendContext;

pub const DEFAULT_SEND_LOG_FILE: &str = "send_log.jsonl";
pub const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(6 * 3600);

/// One delivery attempt. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    pub attempt: u32,
    pub provider: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

/// Handle on the send-log file. Cheap to clone; appends serialize through
/// the shared mutex, readers open the file independently.
#[derive(Debug, Clone)]
pub struct SendLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one attempt outcome. The log is best-effort observability:
    /// failures to write are logged and swallowed.
    pub fn record_attempt(
        &self,
        ctx: Option<&SendContext>,
        msg: &Message,
        attempt: u32,
        error: Option<String>,
    ) {
        let mut entry = SendLogEntry {
            timestamp: Utc::now(),
            job_id: String::new(),
            step: String::new(),
            attempt,
            provider: msg.provider_or_host(),
            success: error.is_none(),
            error: error.unwrap_or_default(),
            recipients: msg.to.clone(),
        };
        if let Some(ctx) = ctx {
            entry.job_id = ctx.job_id.clone();
            entry.step = ctx.step.clone();
        }
        self.append(entry);
    }

    pub fn append(&self, entry: SendLogEntry) {
        let _guard = self.write_lock.lock().unwrap_or_else(|err| err.into_inner());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        let mut file = match file {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "sendlog: cannot open log file");
                return;
            }
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "sendlog: cannot encode entry");
                return;
            }
        };
        if let Err(err) = writeln!(file, "{line}") {
            warn!(error = %err, "sendlog: cannot write entry");
        }
    }

    /// Count successful sends since `since`, optionally filtered by provider
    /// set and recipient domains. A missing log file reads as zero.
    pub fn count_successes_since(
        &self,
        providers: &[String],
        since: DateTime<Utc>,
        to_domains: &[String],
    ) -> io::Result<usize> {
        match File::open(&self.path) {
            Ok(file) => count_successes_from_reader(BufReader::new(file), providers, since, to_domains),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Recency-weighted usage per provider: each matching entry contributes
    /// `exp(-ln2 * age_hours / half_life_hours)` to its provider's bucket.
    pub fn weighted_usage_since(
        &self,
        providers: &[String],
        since: DateTime<Utc>,
        to_domains: &[String],
        half_life: Duration,
    ) -> io::Result<HashMap<String, f64>> {
        match File::open(&self.path) {
            Ok(file) => weighted_usage_from_reader(
                BufReader::new(file),
                providers,
                since,
                to_domains,
                half_life,
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err),
        }
    }
}

fn provider_set(providers: &[String]) -> HashSet<String> {
    providers
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .collect()
}

fn entry_matches(
    entry: &SendLogEntry,
    providers: &HashSet<String>,
    since: DateTime<Utc>,
    to_domains: &[String],
) -> bool {
    if !entry.success || entry.timestamp < since {
        return false;
    }
    if !providers.is_empty()
        && !providers.contains(&entry.provider.trim().to_ascii_lowercase())
    {
        return false;
    }
    if to_domains.is_empty() {
        return true;
    }
    entry.recipients.iter().any(|rcpt| {
        let (_, addr) = mailer_module::split_address(rcpt);
        let domain = extract_domain(&addr);
        !domain.is_empty()
            && to_domains
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(&domain))
    })
}

pub fn count_successes_from_reader(
    reader: impl BufRead,
    providers: &[String],
    since: DateTime<Utc>,
    to_domains: &[String],
) -> io::Result<usize> {
    let providers = provider_set(providers);
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        let Ok(entry) = serde_json::from_str::<SendLogEntry>(&line) else {
            continue;
        };
        if entry_matches(&entry, &providers, since, to_domains) {
            count += 1;
        }
    }
    Ok(count)
}

pub fn weighted_usage_from_reader(
    reader: impl BufRead,
    providers: &[String],
    since: DateTime<Utc>,
    to_domains: &[String],
    half_life: Duration,
) -> io::Result<HashMap<String, f64>> {
    let providers = provider_set(providers);
    let half_life_hours = if half_life.is_zero() {
        DEFAULT_HALF_LIFE.as_secs_f64() / 3600.0
    } else {
        half_life.as_secs_f64() / 3600.0
    };
    let now = Utc::now();
    let mut scores: HashMap<String, f64> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let Ok(entry) = serde_json::from_str::<SendLogEntry>(&line) else {
            continue;
        };
        if !entry_matches(&entry, &providers, since, to_domains) {
            continue;
        }
        let age_hours = (now - entry.timestamp).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let weight = (-std::f64::consts::LN_2 * age_hours / half_life_hours).exp();
        *scores
            .entry(entry.provider.trim().to_ascii_lowercase())
            .or_insert(0.0) += weight;
    }
    Ok(scores)
}
