//! SMTP delivery via lettre: plain, STARTTLS or implicit-TLS connections,
//! PLAIN/LOGIN auth, and an explicit envelope so bcc recipients and a
//! distinct envelope sender are honored.

use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, SmtpTransport, Transport};
use tracing::debug;

use crate::error::MailError;
use crate::message::{split_address, Message};
use crate::mime::build_mime_message;

pub fn send_via_smtp(msg: &Message) -> Result<(), MailError> {
    let mime = build_mime_message(msg)?;
    let recipients = gather_recipients(msg);
    if recipients.is_empty() {
        return Err(MailError::Config("no valid recipients found".to_string()));
    }

    let mut builder = SmtpTransport::builder_dangerous(msg.host.as_str())
        .port(msg.port)
        .timeout(Some(msg.timeout));
    if msg.use_ssl || msg.use_tls {
        let tls = TlsParameters::builder(msg.host.clone())
            .dangerous_accept_invalid_certs(msg.skip_tls_verify)
            .build()?;
        builder = builder.tls(if msg.use_ssl {
            Tls::Wrapper(tls)
        } else {
            Tls::Required(tls)
        });
    }
    if !msg.username.is_empty() && !msg.password.is_empty() {
        if let Some(mechanisms) = auth_mechanisms(&msg.smtp_auth)? {
            builder = builder
                .credentials(Credentials::new(msg.username.clone(), msg.password.clone()))
                .authentication(mechanisms);
        }
    }
    let mailer = builder.build();

    let envelope_from = msg.envelope_from.parse::<Address>()?;
    let envelope_to = recipients
        .iter()
        .map(|addr| addr.parse::<Address>())
        .collect::<Result<Vec<_>, _>>()?;
    let envelope = Envelope::new(Some(envelope_from), envelope_to)?;

    debug!(
        host = %msg.host,
        port = msg.port,
        recipients = recipients.len(),
        "delivering via smtp"
    );
    mailer.send_raw(&envelope, &mime.formatted())?;
    Ok(())
}

fn auth_mechanisms(auth: &str) -> Result<Option<Vec<Mechanism>>, MailError> {
    match auth.trim().to_ascii_lowercase().as_str() {
        "" | "plain" => Ok(Some(vec![Mechanism::Plain])),
        "login" => Ok(Some(vec![Mechanism::Login])),
        "none" => Ok(None),
        other => Err(MailError::SmtpAuth(other.to_string())),
    }
}

/// Envelope recipient set: every to/cc/bcc address, lowercased and
/// deduplicated in input order.
pub fn gather_recipients(msg: &Message) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut recipients = Vec::new();
    for set in [&msg.to, &msg.cc, &msg.bcc] {
        for candidate in set {
            let (_, addr) = split_address(candidate);
            let addr = addr.trim().to_ascii_lowercase();
            if addr.is_empty() || !seen.insert(addr.clone()) {
                continue;
            }
            recipients.push(addr);
        }
    }
    recipients
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_unique_lowercased_recipients() {
        let msg = Message {
            to: vec![
                "User <User@Example.com>".to_string(),
                "second@example.com".to_string(),
            ],
            cc: vec!["user@example.com".to_string()],
            bcc: vec!["hidden@example.com".to_string()],
            ..Message::default()
        };
        let recipients = gather_recipients(&msg);
        assert_eq!(
            recipients,
            vec![
                "user@example.com".to_string(),
                "second@example.com".to_string(),
                "hidden@example.com".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_unknown_auth_mechanism() {
        assert!(matches!(
            auth_mechanisms("cram-md5"),
            Err(MailError::SmtpAuth(_))
        ));
        assert!(auth_mechanisms("none").expect("none is valid").is_none());
        assert!(auth_mechanisms("").expect("default").is_some());
    }
}
