use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use mailer_module::provider_default;

#[test]
fn mailhog_provider_is_registered() {
    let settings = provider_default("mailhog").expect("mailhog registered");
    assert_eq!(settings.transport, "smtp");
    assert_eq!(settings.host, "localhost");
    assert_eq!(settings.port, 1025);
}

/// Connect to a local MailHog and check the SMTP banner. Skipped unless a
/// relay is actually listening (or RUN_MAILHOG_INTEGRATION=1 demands it).
#[test]
fn mailhog_smtp_handshake() {
    let stream = TcpStream::connect_timeout(
        &"127.0.0.1:1025".parse().expect("addr"),
        Duration::from_millis(500),
    );
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            if std::env::var("RUN_MAILHOG_INTEGRATION").as_deref() == Ok("1") {
                panic!("expected MailHog on localhost:1025: {err}");
            }
            eprintln!("skipping MailHog integration test; set RUN_MAILHOG_INTEGRATION=1 to enable");
            return;
        }
    };
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("read timeout");
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).expect("read banner");
    let banner = String::from_utf8_lossy(&buf[..n]);
    assert!(banner.starts_with("220"), "unexpected SMTP banner: {banner}");
    let _ = stream.write_all(b"QUIT\r\n");
}
