//! Polling scheduler: one ticker thread draining due jobs from the store,
//! one worker thread per due job. Dependency ordering between workflow
//! steps goes through the job-result store; a child whose parent has no
//! recorded result yet is simply left for a later tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailer_module::Message;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Dispatcher, SendContext, SendOutcome};
use crate::error::SchedulerError;
use crate::results::{JobResult, JobResultStore};
use crate::store::{JobStore, ScheduledJob};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_CHECK_SLICE: Duration = Duration::from_millis(200);

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    results: Arc<JobResultStore>,
    interval: Duration,
    stop: AtomicBool,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        results: Arc<JobResultStore>,
        interval: Duration,
    ) -> Self {
        let interval = if interval < MIN_POLL_INTERVAL {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                results,
                interval,
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Begin the polling loop. Errors if already running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        info!(interval = ?self.inner.interval, "scheduler starting");

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || {
            while !inner.stop.load(Ordering::SeqCst) {
                run_cycle(&inner, Utc::now());
                // Sleep in slices so stop() is not held up by a long
                // interval.
                let mut slept = Duration::ZERO;
                while slept < inner.interval && !inner.stop.load(Ordering::SeqCst) {
                    let slice = std::cmp::min(STOP_CHECK_SLICE, inner.interval - slept);
                    std::thread::sleep(slice);
                    slept += slice;
                }
            }
        });
        *self
            .ticker
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop accepting ticks and wait for in-flight workers to drain.
    pub fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.drain_workers();
        self.inner.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    /// Run one poll cycle synchronously: launch workers for every due job
    /// and wait for them to finish.
    pub fn tick(&self) {
        run_cycle(&self.inner, Utc::now());
        self.inner.drain_workers();
    }

    /// Persist a job to run at the given time.
    pub fn schedule(
        &self,
        msg: &Message,
        run_at: DateTime<Utc>,
        meta: Map<String, Value>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            message: msg.clone(),
            run_at,
            attempts: 0,
            meta,
        };
        self.inner.store.add(&job)?;
        Ok(job)
    }

    /// Persist a job to run as soon as possible.
    pub fn schedule_now(
        &self,
        msg: &Message,
        meta: Map<String, Value>,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.schedule(msg, Utc::now(), meta)
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn results(&self) -> Arc<JobResultStore> {
        Arc::clone(&self.inner.results)
    }
}

fn run_cycle(inner: &Arc<SchedulerInner>, now: DateTime<Utc>) {
    let jobs = match inner.store.list_due(now) {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(error = %err, "scheduler: error listing due jobs");
            return;
        }
    };
    let mut workers = inner.workers.lock().unwrap_or_else(|err| err.into_inner());
    workers.retain(|handle| !handle.is_finished());
    for job in jobs {
        let worker_inner = Arc::clone(inner);
        workers.push(std::thread::spawn(move || run_job(&worker_inner, job)));
    }
}

impl SchedulerInner {
    fn drain_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|err| err.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_job(inner: &Arc<SchedulerInner>, job: ScheduledJob) {
    info!(job_id = %job.id, run_at = %job.run_at, "scheduler: executing job");
    let ctx = SendContext::from_meta(&job.id, &job.meta);

    if ctx.require_last_success && !ctx.prev_job_id.is_empty() {
        match inner.results.get(&ctx.prev_job_id) {
            Some(JobResult::Success) => {}
            Some(prev) => {
                handle_dependency_failure(inner, &job, &ctx, prev);
                return;
            }
            None => {
                // Parent not terminal yet; natural back-pressure.
                debug!(
                    job_id = %job.id,
                    dependency = %ctx.prev_job_id,
                    "scheduler: job waiting for dependency"
                );
                return;
            }
        }
    }

    let mut msg = job.message.clone();
    for (key, value) in &job.meta {
        if key.trim().is_empty() {
            continue;
        }
        msg.additional_data.insert(key.clone(), value.clone());
    }

    match inner.dispatcher.send(&msg, Some(&ctx)) {
        Ok(SendOutcome::Sent { provider }) => {
            debug!(job_id = %job.id, provider = %provider, "scheduler: job sent");
            inner.results.record(&job.id, JobResult::Success);
            if let Err(err) = inner.store.delete(&job.id) {
                warn!(job_id = %job.id, error = %err, "scheduler: cannot delete job");
            }
        }
        Ok(SendOutcome::Duplicate) => {
            info!(job_id = %job.id, "scheduler: job skipped due to deduplication");
            inner.results.record(&job.id, JobResult::Skipped);
            if let Err(err) = inner.store.delete(&job.id) {
                warn!(job_id = %job.id, error = %err, "scheduler: cannot delete job");
            }
        }
        Err(err) => {
            warn!(job_id = %job.id, error = %err, "scheduler: job failed");
            let mut updated = job.clone();
            updated.attempts += 1;
            // The job stays in the store; rescheduling is the caller's
            // concern.
            if let Err(err) = inner.store.update(&updated) {
                warn!(job_id = %job.id, error = %err, "scheduler: cannot update job");
            }
            inner.results.record(&job.id, JobResult::Failed);
        }
    }
}

fn handle_dependency_failure(
    inner: &Arc<SchedulerInner>,
    job: &ScheduledJob,
    ctx: &SendContext,
    prev: JobResult,
) {
    let (status, action) = if ctx.skip_ahead {
        (JobResult::Skipped, "skipping")
    } else {
        (JobResult::Blocked, "blocking")
    };
    info!(
        job_id = %job.id,
        step = %ctx.step,
        dependency = %ctx.prev_job_id,
        result = ?prev,
        "scheduler: {action} job because dependency did not succeed"
    );
    inner.results.record(&job.id, status);
    if let Err(err) = inner.store.delete(&job.id) {
        warn!(job_id = %job.id, error = %err, "scheduler: cannot delete job");
    }
}
