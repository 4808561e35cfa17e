//! Multi-step campaign scheduling: each step becomes one persistent job,
//! chained to its predecessor through `prev_job_id` metadata so the
//! scheduler can enforce success dependencies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mailer_module::Message;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::dispatch::normalize_bool;
use crate::error::SchedulerError;
use crate::scheduler::Scheduler;

/// One step of a workflow definition. Everything is optional; an empty
/// step schedules the base message immediately.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowStep {
    pub name: String,
    pub step: String,
    pub delay_seconds: Option<f64>,
    pub run_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub to: Vec<String>,
    pub provider_priority: Vec<String>,
    pub retry_count: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub max_retry_delay_seconds: Option<u64>,
    pub require_last_success: Option<bool>,
    pub skip_ahead: Option<bool>,
}

impl WorkflowStep {
    fn label(&self, index: usize) -> String {
        if !self.step.trim().is_empty() {
            self.step.trim().to_string()
        } else if !self.name.trim().is_empty() {
            self.name.trim().to_string()
        } else {
            format!("step-{index}")
        }
    }
}

/// Parse a raw workflow definition (a JSON array of step objects) as found
/// in `workflow_steps` / `workflow_definition` payloads.
pub fn parse_workflow_steps(def: &Value) -> Result<Vec<WorkflowStep>, SchedulerError> {
    let Value::Array(items) = def else {
        return Err(SchedulerError::Workflow(
            "workflow definition must be an array of steps".to_string(),
        ));
    };
    let mut steps = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if !item.is_object() {
            return Err(SchedulerError::Workflow(format!(
                "workflow step {index} must be an object"
            )));
        }
        // Tolerate loose truthiness on the dependency flags before serde
        // sees them.
        let mut item = item.clone();
        if let Some(map) = item.as_object_mut() {
            for key in ["require_last_success", "skip_ahead"] {
                if let Some(value) = map.get(key) {
                    if !value.is_boolean() && !value.is_null() {
                        let coerced = normalize_bool(value);
                        map.insert(key.to_string(), Value::Bool(coerced));
                    }
                }
            }
        }
        let step: WorkflowStep = serde_json::from_value(item).map_err(|err| {
            SchedulerError::Workflow(format!("workflow step {index}: {err}"))
        })?;
        steps.push(step);
    }
    Ok(steps)
}

/// Schedule every step of a workflow against the base message, returning
/// the created job ids in step order.
pub fn schedule_workflow(
    scheduler: &Scheduler,
    base: &Message,
    steps: &[WorkflowStep],
) -> Result<Vec<String>, SchedulerError> {
    let now = Utc::now();
    let mut last_job_id = String::new();
    let mut job_ids = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
        let run_at = step.run_at.unwrap_or_else(|| {
            let delay = step.delay_seconds.unwrap_or(0.0).max(0.0);
            now + chrono::Duration::from_std(Duration::from_secs_f64(delay))
                .unwrap_or_else(|_| chrono::Duration::zero())
        });

        let mut msg = base.clone();
        apply_step_overrides(&mut msg, step);

        let mut meta = Map::new();
        meta.insert("step_index".to_string(), json!(index));
        meta.insert("step".to_string(), json!(step.label(index)));
        if !last_job_id.is_empty() {
            meta.insert("prev_job_id".to_string(), json!(last_job_id));
        }
        let require_last = match step.require_last_success {
            Some(explicit) => explicit,
            // Later steps depend on their predecessor unless told
            // otherwise.
            None => !last_job_id.is_empty(),
        };
        if require_last {
            meta.insert("require_last_success".to_string(), json!(true));
            meta.insert(
                "skip_ahead".to_string(),
                json!(step.skip_ahead.unwrap_or(false)),
            );
        }

        for (key, value) in &meta {
            msg.additional_data.insert(key.clone(), value.clone());
        }

        let job = scheduler.schedule(&msg, run_at, meta)?;
        info!(
            step = %step.label(index),
            job_id = %job.id,
            run_at = %job.run_at,
            "workflow: scheduled step"
        );
        last_job_id = job.id.clone();
        job_ids.push(job.id);
    }
    Ok(job_ids)
}

fn apply_step_overrides(msg: &mut Message, step: &WorkflowStep) {
    if let Some(subject) = step.subject.as_deref().filter(|s| !s.is_empty()) {
        msg.subject = subject.to_string();
        if !msg.raw_subject.is_empty() {
            msg.raw_subject = subject.to_string();
        }
    }
    if let Some(body) = step.body.as_deref() {
        msg.body = body.to_string();
        msg.text_body = body.to_string();
        if !msg.raw_body.is_empty() {
            msg.raw_body = body.to_string();
        }
        if !msg.raw_text_body.is_empty() {
            msg.raw_text_body = body.to_string();
        }
    }
    if let Some(html) = step.html_body.as_deref() {
        msg.html_body = html.to_string();
        if !msg.raw_html_body.is_empty() {
            msg.raw_html_body = html.to_string();
        }
    }
    if !step.to.is_empty() {
        msg.to = step.to.clone();
    }
    if !step.provider_priority.is_empty() {
        msg.provider_priority = step.provider_priority.clone();
    }
    if let Some(count) = step.retry_count {
        msg.retry_count = count;
    }
    if let Some(delay) = step.retry_delay_seconds {
        msg.retry_delay = Duration::from_secs(delay);
    }
    if let Some(cap) = step.max_retry_delay_seconds {
        msg.max_retry_delay = Duration::from_secs(cap);
    }
}

/// The legacy onboarding sequence: welcome now, credentials after a
/// minute, walkthrough after an hour, idle reminder after a week.
pub fn welcome_workflow_steps() -> Vec<WorkflowStep> {
    let step = |name: &str, delay: f64, subject: &str| WorkflowStep {
        name: name.to_string(),
        step: name.to_string(),
        delay_seconds: Some(delay),
        subject: Some(subject.to_string()),
        ..WorkflowStep::default()
    };
    vec![
        step("welcome", 0.0, "Welcome!"),
        step("credentials", 60.0, "Your login credentials"),
        step("walkthrough", 3600.0, "Product walkthrough"),
        step("idle_reminder", 7.0 * 24.0 * 3600.0, "We miss you"),
    ]
}

/// Schedule the built-in `welcome` workflow for the base message.
pub fn schedule_welcome_workflow(
    scheduler: &Scheduler,
    base: &Message,
) -> Result<Vec<String>, SchedulerError> {
    schedule_workflow(scheduler, base, &welcome_workflow_steps())
}
