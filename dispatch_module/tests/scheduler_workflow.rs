use std::time::Duration;

use dispatch_module::{
    parse_workflow_steps, schedule_welcome_workflow, schedule_workflow, JobResult, WorkflowStep,
};
use mailer_module::Message;
use serde_json::{json, Map};
use tempfile::TempDir;

mod test_support;
use test_support::temp_scheduler;

fn dry_run_message() -> Message {
    Message {
        from: "Acme <noreply@acme.example>".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Campaign".to_string(),
        text_body: "hello".to_string(),
        transport: "smtp".to_string(),
        host: "localhost".to_string(),
        port: 1025,
        provider: "smtp".to_string(),
        dry_run: true,
        ..Message::default()
    }
}

fn step(name: &str, delay: f64) -> WorkflowStep {
    WorkflowStep {
        name: name.to_string(),
        step: name.to_string(),
        delay_seconds: Some(delay),
        ..WorkflowStep::default()
    }
}

#[test]
fn workflow_persists_one_chained_job_per_step() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    let steps = vec![step("first", 0.0), step("second", 60.0), step("third", 120.0)];

    let ids = schedule_workflow(&scheduler, &dry_run_message(), &steps).expect("schedule");
    assert_eq!(ids.len(), 3);

    let jobs = scheduler.store().list_all().expect("list");
    assert_eq!(jobs.len(), 3);
    for (index, id) in ids.iter().enumerate() {
        let job = jobs.iter().find(|job| &job.id == id).expect("job persisted");
        assert_eq!(job.meta.get("step_index"), Some(&json!(index)));
        if index == 0 {
            assert!(job.meta.get("prev_job_id").is_none());
        } else {
            assert_eq!(job.meta.get("prev_job_id"), Some(&json!(ids[index - 1])));
            assert_eq!(job.meta.get("require_last_success"), Some(&json!(true)));
            assert_eq!(job.meta.get("skip_ahead"), Some(&json!(false)));
        }
    }
}

#[test]
fn welcome_workflow_schedules_four_steps() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    let ids = schedule_welcome_workflow(&scheduler, &dry_run_message()).expect("schedule");
    assert_eq!(ids.len(), 4);

    let jobs = scheduler.store().list_all().expect("list");
    let subjects: Vec<_> = jobs.iter().map(|job| job.message.subject.as_str()).collect();
    for expected in [
        "Welcome!",
        "Your login credentials",
        "Product walkthrough",
        "We miss you",
    ] {
        assert!(subjects.contains(&expected), "missing subject {expected}");
    }
}

#[test]
fn tick_executes_due_jobs_and_deletes_on_success() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    let job = scheduler
        .schedule_now(&dry_run_message(), Map::new())
        .expect("schedule");

    scheduler.tick();

    assert_eq!(scheduler.results().get(&job.id), Some(JobResult::Success));
    assert!(scheduler.store().list_all().expect("list").is_empty());
}

#[test]
fn future_jobs_are_left_alone() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    let job = scheduler
        .schedule(
            &dry_run_message(),
            chrono::Utc::now() + chrono::Duration::hours(1),
            Map::new(),
        )
        .expect("schedule");

    scheduler.tick();

    assert_eq!(scheduler.results().get(&job.id), None);
    assert_eq!(scheduler.store().list_all().expect("list").len(), 1);
}

#[test]
fn dependent_chain_runs_to_completion() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    let steps = vec![step("first", 0.0), step("second", 0.0)];
    let ids = schedule_workflow(&scheduler, &dry_run_message(), &steps).expect("schedule");

    // The second step may observe its dependency as unresolved on the
    // first pass and wait; a second tick settles the chain.
    scheduler.tick();
    scheduler.tick();

    assert_eq!(scheduler.results().get(&ids[0]), Some(JobResult::Success));
    assert_eq!(scheduler.results().get(&ids[1]), Some(JobResult::Success));
    assert!(scheduler.store().list_all().expect("list").is_empty());
}

#[test]
fn failed_dependency_blocks_child() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));

    let mut meta = Map::new();
    meta.insert("prev_job_id".to_string(), json!("parent-job"));
    meta.insert("require_last_success".to_string(), json!(true));
    meta.insert("skip_ahead".to_string(), json!(false));
    let child = scheduler
        .schedule_now(&dry_run_message(), meta)
        .expect("schedule");

    scheduler.results().record("parent-job", JobResult::Failed);
    scheduler.tick();

    assert_eq!(scheduler.results().get(&child.id), Some(JobResult::Blocked));
    assert!(scheduler.store().list_all().expect("list").is_empty());
}

#[test]
fn skip_ahead_child_records_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));

    let mut meta = Map::new();
    meta.insert("prev_job_id".to_string(), json!("parent-job"));
    meta.insert("require_last_success".to_string(), json!(true));
    meta.insert("skip_ahead".to_string(), json!(true));
    let child = scheduler
        .schedule_now(&dry_run_message(), meta)
        .expect("schedule");

    scheduler.results().record("parent-job", JobResult::Failed);
    scheduler.tick();

    assert_eq!(scheduler.results().get(&child.id), Some(JobResult::Skipped));
    assert!(scheduler.store().list_all().expect("list").is_empty());
}

#[test]
fn unresolved_dependency_leaves_job_in_store() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));

    let mut meta = Map::new();
    meta.insert("prev_job_id".to_string(), json!("parent-job"));
    meta.insert("require_last_success".to_string(), json!(true));
    let child = scheduler
        .schedule_now(&dry_run_message(), meta)
        .expect("schedule");

    scheduler.tick();

    assert_eq!(scheduler.results().get(&child.id), None);
    assert_eq!(scheduler.store().list_all().expect("list").len(), 1);
}

#[test]
fn failed_send_increments_attempts_and_keeps_job() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(5));
    // No transport coordinates anywhere: every provider candidate fails
    // finalization, so the dispatch errors without touching the network.
    let msg = Message {
        from: "noreply@acme.example".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Doomed".to_string(),
        ..Message::default()
    };
    let job = scheduler.schedule_now(&msg, Map::new()).expect("schedule");

    scheduler.tick();

    assert_eq!(scheduler.results().get(&job.id), Some(JobResult::Failed));
    let jobs = scheduler.store().list_all().expect("list");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempts, 1);

    scheduler.tick();
    let jobs = scheduler.store().list_all().expect("list");
    assert_eq!(jobs[0].attempts, 2);
}

#[test]
fn start_twice_is_rejected_and_stop_drains() {
    let dir = TempDir::new().expect("tempdir");
    let scheduler = temp_scheduler(dir.path(), Duration::from_secs(1));
    scheduler.start().expect("first start");
    assert!(scheduler.start().is_err());
    scheduler.stop();
    // After a clean stop the scheduler can be started again.
    scheduler.start().expect("restart");
    scheduler.stop();
}

#[test]
fn parse_steps_accepts_inline_definition() {
    let def = json!([
        {"name": "first", "delay_seconds": 0},
        {"name": "second", "delay_seconds": 30, "subject": "Step two"},
    ]);
    let steps = parse_workflow_steps(&def).expect("parse");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].subject.as_deref(), Some("Step two"));
}
