use std::time::Duration;

use dispatch_module::SendOutcome;
use mailer_module::{register_provider_default, Message, ProviderSettings, ScheduleMode};
use tempfile::TempDir;

mod test_support;
use test_support::{read_log_entries, start_mockito_server, temp_dispatcher};

fn http_message(endpoint: &str) -> Message {
    Message {
        from: "noreply@acme.example".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Release 1.4".to_string(),
        text_body: "It shipped.".to_string(),
        transport: "http".to_string(),
        endpoint: endpoint.to_string(),
        provider: "acme-api".to_string(),
        timeout: Duration::from_secs(5),
        ..Message::default()
    }
}

#[test]
fn dry_run_sends_nothing_and_logs_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    let msg = Message {
        from: "Acme <noreply@acme.example>".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Dry Run".to_string(),
        transport: "smtp".to_string(),
        host: "localhost".to_string(),
        port: 1025,
        provider: "smtp".to_string(),
        dry_run: true,
        ..Message::default()
    };
    let outcome = dispatcher.send(&msg, None).expect("dry run succeeds");
    assert!(matches!(outcome, SendOutcome::Sent { .. }));
    assert!(read_log_entries(dir.path()).is_empty());
}

#[test]
fn successful_http_send_appends_one_entry() {
    let Some(mut server) = start_mockito_server("successful_http_send_appends_one_entry") else {
        return;
    };
    let mock = server.mock("POST", "/send").with_status(200).create();

    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    let msg = http_message(&format!("{}/send", server.url()));

    let outcome = dispatcher.send(&msg, None).expect("send");
    assert_eq!(
        outcome,
        SendOutcome::Sent {
            provider: "acme-api".to_string()
        }
    );
    mock.assert();

    let entries = read_log_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].provider, "acme-api");
    assert_eq!(entries[0].attempt, 1);
}

#[test]
fn dedup_skips_second_identical_send() {
    let Some(mut server) = start_mockito_server("dedup_skips_second_identical_send") else {
        return;
    };
    let mock = server.mock("POST", "/send").with_status(200).expect(1).create();

    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    let mut msg = http_message(&format!("{}/send", server.url()));
    msg.schedule_mode = ScheduleMode::Once;

    let first = dispatcher.send(&msg, None).expect("first send");
    assert!(matches!(first, SendOutcome::Sent { .. }));
    let second = dispatcher.send(&msg, None).expect("second send");
    assert_eq!(second, SendOutcome::Duplicate);
    mock.assert();

    // The duplicate shortcut appends no log entry.
    let entries = read_log_entries(dir.path());
    assert_eq!(entries.len(), 1);
}

#[test]
fn retries_then_falls_back_to_next_provider() {
    let Some(mut server) = start_mockito_server("retries_then_falls_back_to_next_provider") else {
        return;
    };
    let failing = server
        .mock("POST", "/flaky")
        .with_status(500)
        .with_body("boom")
        .expect(2)
        .create();
    let healthy = server.mock("POST", "/steady").with_status(200).create();

    register_provider_default(
        "flaky-api",
        ProviderSettings {
            transport: "http".into(),
            endpoint: format!("{}/flaky", server.url()),
            ..ProviderSettings::default()
        },
    );
    register_provider_default(
        "steady-api",
        ProviderSettings {
            transport: "http".into(),
            endpoint: format!("{}/steady", server.url()),
            ..ProviderSettings::default()
        },
    );

    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    let msg = Message {
        from: "noreply@acme.example".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Fallback".to_string(),
        text_body: "body".to_string(),
        transport: "http".to_string(),
        provider_priority: vec!["flaky-api".to_string(), "steady-api".to_string()],
        retry_count: 2,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
        ..Message::default()
    };

    let outcome = dispatcher.send(&msg, None).expect("fallback send");
    assert_eq!(
        outcome,
        SendOutcome::Sent {
            provider: "steady-api".to_string()
        }
    );
    failing.assert();
    healthy.assert();

    let entries = read_log_entries(dir.path());
    // Two failed attempts on the first provider, then one success.
    assert_eq!(entries.len(), 3);
    assert!(!entries[0].success);
    assert_eq!(entries[0].attempt, 1);
    assert!(!entries[1].success);
    assert_eq!(entries[1].attempt, 2);
    assert!(entries[2].success);
    assert_eq!(entries[2].provider, "steady-api");
}

#[test]
fn all_providers_exhausted_returns_last_failure() {
    let Some(mut server) = start_mockito_server("all_providers_exhausted_returns_last_failure")
    else {
        return;
    };
    let _mock = server
        .mock("POST", "/down")
        .with_status(503)
        .with_body("maintenance")
        .create();

    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    let mut msg = http_message(&format!("{}/down", server.url()));
    msg.provider = "down-api".to_string();

    let err = dispatcher.send(&msg, None).expect_err("must fail");
    let text = err.to_string();
    assert!(text.contains("503"), "error was: {text}");

    let entries = read_log_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert!(entries[0].error.contains("503"));
}

#[test]
fn config_error_provider_is_skipped_without_retry() {
    let Some(mut server) = start_mockito_server("config_error_provider_is_skipped_without_retry")
    else {
        return;
    };
    let healthy = server.mock("POST", "/ok").with_status(200).create();

    register_provider_default(
        "good-api",
        ProviderSettings {
            transport: "http".into(),
            endpoint: format!("{}/ok", server.url()),
            ..ProviderSettings::default()
        },
    );

    let dir = TempDir::new().expect("tempdir");
    let dispatcher = temp_dispatcher(dir.path());
    // First candidate has no transport coordinates at all, so finalization
    // fails and the dispatcher moves on without logging an attempt for it.
    let msg = Message {
        from: "noreply@acme.example".to_string(),
        to: vec!["user@example.com".to_string()],
        subject: "Skip broken provider".to_string(),
        text_body: "body".to_string(),
        provider_priority: vec!["unconfigured-relay".to_string(), "good-api".to_string()],
        timeout: Duration::from_secs(5),
        ..Message::default()
    };

    let outcome = dispatcher.send(&msg, None).expect("send");
    assert_eq!(
        outcome,
        SendOutcome::Sent {
            provider: "good-api".to_string()
        }
    );
    healthy.assert();

    let entries = read_log_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
}
