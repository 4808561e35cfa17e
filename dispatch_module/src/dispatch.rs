//! The send pipeline: placeholder re-resolution, dedup short-circuit,
//! provider resolution, and the per-provider retry loop with full-jitter
//! backoff and provider fallback.

use std::sync::Arc;
use std::time::Duration;

use mailer_module::{
    apply_http_profile, apply_placeholders, apply_provider_defaults, finalize_message, Message,
};
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dedup::{dedup_key, DedupStore};
use crate::error::DispatchError;
use crate::routing::resolve_providers;
use crate::sendlog::SendLog;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Execution context carried from a scheduled job into the send pipeline
/// and the send log.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub job_id: String,
    pub step: String,
    pub step_index: usize,
    pub prev_job_id: String,
    pub require_last_success: bool,
    pub skip_ahead: bool,
}

impl SendContext {
    /// Lift the workflow fields out of a job's metadata map.
    pub fn from_meta(job_id: &str, meta: &Map<String, Value>) -> Self {
        let mut ctx = SendContext {
            job_id: job_id.to_string(),
            ..SendContext::default()
        };
        if let Some(index) = meta.get("step_index") {
            ctx.step_index = as_usize(index);
        }
        if let Some(step) = meta.get("step").and_then(Value::as_str) {
            if !step.is_empty() {
                ctx.step = step.to_string();
            }
        }
        if ctx.step.is_empty() {
            if let Some(name) = meta.get("name").and_then(Value::as_str) {
                ctx.step = name.to_string();
            }
        }
        if let Some(prev) = meta.get("prev_job_id").and_then(Value::as_str) {
            ctx.prev_job_id = prev.to_string();
        }
        if let Some(require) = meta.get("require_last_success") {
            ctx.require_last_success = normalize_bool(require);
        }
        if let Some(skip) = meta.get("skip_ahead") {
            ctx.skip_ahead = normalize_bool(skip);
        }
        ctx
    }
}

/// Loose truthiness for metadata values that may arrive as bools, strings
/// or numbers.
pub fn normalize_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let lower = s.trim().to_ascii_lowercase();
            lower == "true" || lower == "yes" || lower == "1"
        }
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

/// Distinguishable non-failure outcomes of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { provider: String },
    /// The dedup store already holds this message's fingerprint.
    Duplicate,
}

/// Executes sends against the resolved provider list, recording every
/// attempt in the send log and fingerprints of successes in the dedup
/// store.
pub struct Dispatcher {
    send_log: SendLog,
    dedup: Arc<DedupStore>,
}

impl Dispatcher {
    pub fn new(send_log: SendLog, dedup: Arc<DedupStore>) -> Self {
        Self { send_log, dedup }
    }

    pub fn send_log(&self) -> &SendLog {
        &self.send_log
    }

    pub fn send(
        &self,
        msg: &Message,
        ctx: Option<&SendContext>,
    ) -> Result<SendOutcome, DispatchError> {
        let prepared = prepare_send_message(msg);

        let key = dedup_key(&prepared, ctx);
        if let Some(key) = key.as_deref() {
            if self.dedup.has(key) {
                match ctx {
                    Some(ctx) => info!(
                        job_id = %ctx.job_id,
                        step = %ctx.step,
                        "duplicate detected, skipping"
                    ),
                    None => info!("duplicate detected, skipping immediate send"),
                }
                return Ok(SendOutcome::Duplicate);
            }
        }

        let providers = resolve_providers(&prepared, &self.send_log);
        if prepared.dry_run {
            info!(
                to = ?prepared.to,
                ?providers,
                subject = %prepared.subject,
                "dry-run: would send"
            );
            return Ok(SendOutcome::Sent {
                provider: providers.first().cloned().unwrap_or_default(),
            });
        }

        let mut last_err: Option<DispatchError> = None;
        for provider in &providers {
            let mut attempt_msg = prepared.clone();
            attempt_msg.provider = provider.clone();
            apply_provider_defaults(&mut attempt_msg);
            apply_http_profile(&mut attempt_msg);
            if let Err(err) = finalize_message(&mut attempt_msg) {
                // Config errors never retry; move straight to the next
                // provider.
                warn!(provider = %provider, error = %err, "skipping provider due to config error");
                last_err = Some(err.into());
                continue;
            }

            for attempt in 1..=attempt_msg.retry_count {
                let result = mailer_module::deliver(&attempt_msg);
                self.send_log.record_attempt(
                    ctx,
                    &attempt_msg,
                    attempt,
                    result.as_ref().err().map(|err| err.to_string()),
                );
                match result {
                    Ok(()) => {
                        if let Some(key) = key.as_deref() {
                            self.dedup.mark(key);
                        }
                        return Ok(SendOutcome::Sent {
                            provider: provider.clone(),
                        });
                    }
                    Err(err) => {
                        warn!(
                            provider = %provider,
                            attempt,
                            retry_count = attempt_msg.retry_count,
                            error = %err,
                            "send attempt failed"
                        );
                        last_err = Some(err.into());
                        if attempt < attempt_msg.retry_count {
                            let delay = full_jitter(
                                attempt,
                                attempt_msg.retry_delay,
                                attempt_msg.max_retry_delay,
                            );
                            std::thread::sleep(delay);
                        }
                    }
                }
            }
            warn!(provider = %provider, "provider exhausted, trying next provider if any");
        }
        Err(last_err.unwrap_or(DispatchError::NoProvider))
    }
}

/// Clone the message and re-run placeholder resolution from its raw
/// template fields so per-job metadata lands in the rendered bodies.
fn prepare_send_message(msg: &Message) -> Message {
    let mut prepared = msg.clone();
    prepared.restore_raw_content();
    apply_placeholders(&mut prepared);
    prepared.resolve_bodies();
    prepared
}

/// Full-jitter backoff: uniform over `[0, min(cap, base * 2^(attempt-1))]`.
pub fn full_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base = if base.is_zero() {
        DEFAULT_BACKOFF_BASE
    } else {
        base
    };
    let shift = attempt.saturating_sub(1).min(20);
    let mut upper = base.saturating_mul(1u32 << shift);
    if !cap.is_zero() && upper > cap {
        upper = cap;
    }
    if upper.is_zero() {
        return Duration::ZERO;
    }
    let millis = upper.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

fn as_usize(value: &Value) -> usize {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0) as usize,
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
