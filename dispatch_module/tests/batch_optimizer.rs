use std::collections::BTreeMap;

use chrono::Utc;
use dispatch_module::{BatchOptimizer, GreedyBatchOptimizer, ScheduledJob};
use mailer_module::{Message, ProviderRoute};
use serde_json::Map;
use tempfile::TempDir;

mod test_support;
use test_support::temp_send_log;

fn batch_job(id: &str, msg: &Message) -> ScheduledJob {
    ScheduledJob {
        id: id.to_string(),
        message: msg.clone(),
        run_at: Utc::now(),
        attempts: 0,
        meta: Map::new(),
    }
}

#[test]
fn respects_per_route_capacities() {
    let dir = TempDir::new().expect("tempdir");
    let optimizer = GreedyBatchOptimizer::new(temp_send_log(dir.path()));

    let msg = Message {
        to: vec!["user@gmail.com".to_string()],
        provider_priority: vec!["sendgrid".to_string(), "smtp".to_string()],
        provider_routes: vec![ProviderRoute {
            to_domains: vec!["gmail.com".to_string()],
            provider_priority: vec!["sendgrid".to_string(), "smtp".to_string()],
            provider_capacities: BTreeMap::from([
                ("sendgrid".to_string(), 2u32),
                ("smtp".to_string(), 100u32),
            ]),
            ..ProviderRoute::default()
        }],
        ..Message::default()
    };
    let jobs = vec![
        batch_job("job1", &msg),
        batch_job("job2", &msg),
        batch_job("job3", &msg),
    ];

    let allocations = optimizer.allocate_jobs(&jobs);
    assert_eq!(allocations.len(), 3);
    let sendgrid = allocations.values().filter(|p| p.as_str() == "sendgrid").count();
    let smtp = allocations.values().filter(|p| p.as_str() == "smtp").count();
    assert_eq!(sendgrid, 2, "allocations={allocations:?}");
    assert_eq!(smtp, 1, "allocations={allocations:?}");
}

#[test]
fn prefers_lower_cost_when_route_overrides_costs() {
    let dir = TempDir::new().expect("tempdir");
    let optimizer = GreedyBatchOptimizer::new(temp_send_log(dir.path()));

    let msg = Message {
        to: vec!["user@gmail.com".to_string()],
        provider_priority: vec!["sendgrid".to_string(), "smtp".to_string()],
        provider_routes: vec![ProviderRoute {
            to_domains: vec!["gmail.com".to_string()],
            provider_priority: vec!["sendgrid".to_string(), "smtp".to_string()],
            provider_cost_overrides: BTreeMap::from([
                ("sendgrid".to_string(), 2.0f64),
                ("smtp".to_string(), 1.0f64),
            ]),
            ..ProviderRoute::default()
        }],
        ..Message::default()
    };
    let jobs = vec![batch_job("job1", &msg)];

    let allocations = optimizer.allocate_jobs(&jobs);
    assert_eq!(allocations.get("job1").map(String::as_str), Some("smtp"));
}

#[test]
fn falls_back_to_message_provider_without_routes() {
    let dir = TempDir::new().expect("tempdir");
    let optimizer = GreedyBatchOptimizer::new(temp_send_log(dir.path()));

    let msg = Message {
        to: vec!["user@example.com".to_string()],
        provider: "postmark".to_string(),
        ..Message::default()
    };
    let jobs = vec![batch_job("solo", &msg)];

    let allocations = optimizer.allocate_jobs(&jobs);
    assert_eq!(allocations.get("solo").map(String::as_str), Some("postmark"));
}

#[test]
fn most_constrained_jobs_are_assigned_first() {
    let dir = TempDir::new().expect("tempdir");
    let optimizer = GreedyBatchOptimizer::new(temp_send_log(dir.path()));

    // The single-candidate job must win the only slot on "scarce" even
    // though the flexible job sorts earlier by id.
    let route = ProviderRoute {
        to_domains: vec!["example.com".to_string()],
        provider_priority: vec!["scarce".to_string(), "plenty".to_string()],
        provider_capacities: BTreeMap::from([
            ("scarce".to_string(), 1u32),
            ("plenty".to_string(), 100u32),
        ]),
        ..ProviderRoute::default()
    };
    let flexible = Message {
        to: vec!["user@example.com".to_string()],
        provider_priority: vec!["scarce".to_string(), "plenty".to_string()],
        provider_routes: vec![route.clone()],
        ..Message::default()
    };
    let constrained = Message {
        to: vec!["user@example.com".to_string()],
        provider_priority: vec!["scarce".to_string()],
        provider_routes: vec![route],
        ..Message::default()
    };
    let jobs = vec![batch_job("a-flexible", &flexible), batch_job("b-pinned", &constrained)];

    let allocations = optimizer.allocate_jobs(&jobs);
    assert_eq!(allocations.get("b-pinned").map(String::as_str), Some("scarce"));
    assert_eq!(allocations.get("a-flexible").map(String::as_str), Some("plenty"));
}
