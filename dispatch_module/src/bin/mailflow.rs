//! mailflow CLI: send a message immediately, enqueue it (or a workflow)
//! for later, or run the scheduler worker loop.

use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dispatch_module::{
    parse_workflow_steps, schedule_welcome_workflow, schedule_workflow, DedupStore, Dispatcher,
    FileJobStore, JobResultStore, Scheduler, SendLog, SendOutcome, DEFAULT_DEDUP_FILE,
    DEFAULT_RESULTS_FILE, DEFAULT_SEND_LOG_FILE, DEFAULT_STORE_FILE,
};
use mailer_module::{apply_placeholders, finalize_message, Message};

fn print_usage() {
    eprintln!(
        r##"Usage: mailflow [options] [template.json] [payload.json]

Options:
  --template <path>   base message JSON (first positional arg otherwise)
  --payload <path>    overlay JSON deep-merged over the template
  --schedule          enqueue the message (or workflow) instead of sending now
  --worker            run the scheduler loop until the process is signalled
  --store <path>      job store file (default {DEFAULT_STORE_FILE})
  --interval <secs>   worker poll interval (default 5)

Scheduling fields read from additional_data:
  run_at              RFC 3339 instant for a single job
  delay_seconds       offset from now for a single job
  workflow            "welcome", or an inline array of steps
  workflow_steps      array of workflow steps
  workflow_definition array of workflow steps

Examples:
  mailflow message.json
  mailflow --template template.smtp.json --payload payload.release.json
  mailflow --schedule campaign.json
  mailflow --worker --store scheduler_store.json
"##
    );
}

struct Options {
    template: Option<String>,
    payload: Option<String>,
    worker: bool,
    schedule: bool,
    store_path: String,
    interval: u64,
}

fn parse_args() -> Options {
    let mut options = Options {
        template: None,
        payload: None,
        worker: false,
        schedule: false,
        store_path: DEFAULT_STORE_FILE.to_string(),
        interval: 5,
    };
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--template" => options.template = args.next(),
            "--payload" => options.payload = args.next(),
            "--store" => {
                if let Some(path) = args.next() {
                    options.store_path = path;
                }
            }
            "--interval" => {
                if let Some(raw) = args.next() {
                    match raw.parse() {
                        Ok(secs) => options.interval = secs,
                        Err(_) => {
                            error!(value = %raw, "invalid --interval");
                            exit(2);
                        }
                    }
                }
            }
            "--schedule" => options.schedule = true,
            "--worker" => options.worker = true,
            "--help" | "-h" => {
                print_usage();
                exit(0);
            }
            other => positional.push(other.to_string()),
        }
    }
    let mut positional = positional.into_iter();
    if options.template.is_none() {
        options.template = positional.next();
    }
    if options.payload.is_none() {
        options.payload = positional.next();
    }
    options
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args();

    if options.worker {
        run_worker(&options);
        return;
    }

    let Some(template) = options.template.as_deref() else {
        print_usage();
        error!("no template or config file provided");
        exit(2);
    };
    let msg = match load_message(template, options.payload.as_deref()) {
        Ok(msg) => msg,
        Err(err) => {
            error!(error = %err, "config error");
            exit(1);
        }
    };

    if options.schedule {
        schedule_message(&options, &msg);
        return;
    }

    send_now(&msg);
}

fn build_scheduler(options: &Options) -> Scheduler {
    let send_log = SendLog::new(DEFAULT_SEND_LOG_FILE);
    let dedup = Arc::new(DedupStore::new(DEFAULT_DEDUP_FILE));
    let dispatcher = Arc::new(Dispatcher::new(send_log, dedup));
    let store = Arc::new(FileJobStore::new(&options.store_path));
    let results = Arc::new(JobResultStore::new(DEFAULT_RESULTS_FILE));
    Scheduler::new(store, dispatcher, results, Duration::from_secs(options.interval))
}

fn run_worker(options: &Options) {
    let scheduler = build_scheduler(options);
    if let Err(err) = scheduler.start() {
        error!(error = %err, "cannot start scheduler");
        exit(1);
    }
    info!(store = %options.store_path, "worker running");
    loop {
        std::thread::park();
    }
}

fn schedule_message(options: &Options, msg: &Message) {
    let scheduler = build_scheduler(options);

    let workflow = msg.additional_data.get("workflow").cloned();
    if let Some(Value::String(name)) = &workflow {
        if name == "welcome" {
            if let Err(err) = schedule_welcome_workflow(&scheduler, msg) {
                error!(error = %err, "schedule workflow failed");
                exit(1);
            }
            return;
        }
    }
    let inline_steps = match &workflow {
        Some(Value::Array(_)) => workflow.clone(),
        _ => msg
            .additional_data
            .get("workflow_steps")
            .or_else(|| msg.additional_data.get("workflow_definition"))
            .cloned(),
    };
    if let Some(def) = inline_steps {
        let steps = match parse_workflow_steps(&def) {
            Ok(steps) => steps,
            Err(err) => {
                error!(error = %err, "schedule workflow failed");
                exit(1);
            }
        };
        if let Err(err) = schedule_workflow(&scheduler, msg, &steps) {
            error!(error = %err, "schedule workflow failed");
            exit(1);
        }
        return;
    }

    let mut run_at = Utc::now();
    if let Some(raw) = msg.additional_data.get("run_at").and_then(Value::as_str) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            run_at = parsed.with_timezone(&Utc);
        }
    } else if let Some(delay) = msg.additional_data.get("delay_seconds").and_then(Value::as_f64) {
        if delay > 0.0 {
            run_at = Utc::now()
                + chrono::Duration::from_std(Duration::from_secs_f64(delay))
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
    match scheduler.schedule(msg, run_at, Map::new()) {
        Ok(job) => info!(job_id = %job.id, run_at = %job.run_at, "scheduled job"),
        Err(err) => {
            error!(error = %err, "schedule failed");
            exit(1);
        }
    }
}

fn send_now(msg: &Message) {
    info!(
        to = ?msg.to,
        target = %msg.transport_details(),
        provider = %msg.provider_or_host(),
        "sending email"
    );
    let send_log = SendLog::new(DEFAULT_SEND_LOG_FILE);
    let dedup = Arc::new(DedupStore::new(DEFAULT_DEDUP_FILE));
    let dispatcher = Dispatcher::new(send_log, dedup);
    match dispatcher.send(msg, None) {
        Ok(SendOutcome::Sent { provider }) => {
            info!(provider = %provider, "email sent successfully");
        }
        Ok(SendOutcome::Duplicate) => {
            info!("send skipped: duplicate detected (schedule_mode=once)");
        }
        Err(err) => {
            error!(error = %err, "send failed");
            exit(1);
        }
    }
}

fn load_message(template: &str, payload: Option<&str>) -> Result<Message, String> {
    let mut merged = read_json_object(template)?;
    info!(path = %template, "loaded template");
    if let Some(payload) = payload {
        let overlay = read_json_object(payload)?;
        info!(path = %payload, "applying payload overrides");
        merge_maps(&mut merged, overlay);
    }
    let mut msg: Message = serde_json::from_value(Value::Object(merged))
        .map_err(|err| format!("invalid message config: {err}"))?;
    finalize_message(&mut msg).map_err(|err| err.to_string())?;
    msg.capture_raw_content();
    apply_placeholders(&mut msg);
    msg.resolve_bodies();
    msg.restore_raw_content();
    Ok(msg)
}

fn read_json_object(path: &str) -> Result<Map<String, Value>, String> {
    let data = std::fs::read(Path::new(path)).map_err(|err| format!("{path}: {err}"))?;
    let value: Value =
        serde_json::from_slice(&data).map_err(|err| format!("{path}: {err}"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(format!("{path}: expected a JSON object")),
    }
}

/// Deep-merge override into base: objects merge recursively, everything
/// else replaces.
fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
