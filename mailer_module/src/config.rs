//! Message finalization: fills transport coordinates from the provider
//! registries, settles sender/envelope addresses, and validates the fields a
//! send cannot proceed without. Runs once at config time and again per
//! provider inside the dispatcher's fallback loop.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::MailError;
use crate::message::{looks_like_url, split_address, Message};
use crate::providers::{http_profile, provider_default, provider_for_domain};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Normalize and validate a message in place.
pub fn finalize_message(msg: &mut Message) -> Result<(), MailError> {
    msg.provider = msg.provider.trim().to_ascii_lowercase();
    if msg.provider.is_empty() {
        msg.provider = infer_provider(&[msg.from.as_str(), msg.username.as_str()]);
    }
    if msg.http_auth_prefix.is_empty() {
        msg.http_auth_prefix = "Bearer".to_string();
    }
    apply_provider_defaults(msg);
    apply_http_profile(msg);

    if msg.transport.is_empty() {
        if looks_like_url(&msg.endpoint) || looks_like_url(&msg.host) {
            msg.transport = "http".to_string();
        } else {
            msg.transport = "smtp".to_string();
        }
    }
    if msg.transport != "http" {
        msg.transport = "smtp".to_string();
    }
    if msg.transport == "http" && msg.endpoint.is_empty() {
        msg.endpoint = msg.host.clone();
    }
    if msg.transport == "http" && !msg.endpoint.is_empty() && !looks_like_url(&msg.endpoint) {
        msg.endpoint = format!("https://{}", msg.endpoint.trim_start_matches([':', '/']));
    }

    if msg.from.is_empty() && !msg.username.is_empty() {
        msg.from = msg.username.clone();
    }
    let (name, addr) = split_address(&msg.from);
    if msg.from_name.is_empty() {
        msg.from_name = name;
    }
    if addr.is_empty() {
        return Err(MailError::Config("sender address is required".to_string()));
    }
    msg.from = addr.clone();
    if msg.envelope_from.is_empty() {
        msg.envelope_from = addr.clone();
    }
    if !msg.return_path.is_empty() {
        msg.envelope_from = msg.return_path.clone();
    }
    if msg.username.is_empty() {
        msg.username = addr;
    }
    if msg.aws_region.is_empty() {
        msg.aws_region = infer_aws_region(&msg.endpoint);
    }

    if msg.subject.is_empty() {
        msg.subject = "(no subject)".to_string();
    }
    msg.resolve_bodies();

    if msg.to.is_empty() {
        return Err(MailError::Config(
            "at least one recipient (to) is required".to_string(),
        ));
    }

    if msg.transport == "smtp" {
        if msg.host.is_empty() {
            return Err(MailError::Config("smtp host is required".to_string()));
        }
        if msg.port == 0 {
            msg.port = if msg.use_ssl {
                465
            } else if msg.use_tls {
                587
            } else {
                25
            };
        }
    } else if msg.endpoint.is_empty() {
        return Err(MailError::Config(
            "http endpoint is required when transport=http".to_string(),
        ));
    }

    if msg.timeout.is_zero() {
        msg.timeout = DEFAULT_TIMEOUT;
    }
    if msg.retry_count == 0 {
        msg.retry_count = 1;
    }
    if msg.retry_delay.is_zero() {
        msg.retry_delay = DEFAULT_RETRY_DELAY;
    }
    apply_http_scaling_defaults(msg);

    Ok(())
}

/// Fill host/port/TLS/transport/endpoint from the provider registry where
/// the message left them blank.
pub fn apply_provider_defaults(msg: &mut Message) {
    if msg.provider.is_empty() {
        return;
    }
    let Some(defaults) = provider_default(&msg.provider) else {
        return;
    };
    if msg.host.is_empty() {
        msg.host = defaults.host;
    }
    if msg.port == 0 {
        msg.port = defaults.port;
    }
    if !msg.use_tls && !msg.use_ssl {
        msg.use_tls = defaults.use_tls;
        msg.use_ssl = defaults.use_ssl;
    }
    if msg.transport.is_empty() && !defaults.transport.is_empty() {
        msg.transport = defaults.transport;
    }
    if msg.endpoint.is_empty() && !defaults.endpoint.is_empty() {
        msg.endpoint = defaults.endpoint;
    }
}

/// Overlay the provider's HTTP profile: endpoint, method, payload format,
/// content type, auth defaults and header templates.
pub fn apply_http_profile(msg: &mut Message) {
    let Some(profile) = http_profile(&msg.provider) else {
        return;
    };
    if msg.transport.is_empty() {
        msg.transport = "http".to_string();
    }
    if msg.transport != "http" {
        return;
    }
    if msg.endpoint.is_empty() {
        msg.endpoint = profile.endpoint.clone();
    }
    if msg.http_method.is_empty() && !profile.method.is_empty() {
        msg.http_method = profile.method.clone();
    }
    if msg.payload_format.is_empty() && !profile.payload_format.is_empty() {
        msg.payload_format = profile.payload_format.clone();
    }
    if msg.http_content_type.is_empty() {
        msg.http_content_type = profile.content_type.clone();
    }

    match msg.provider.as_str() {
        "ses" | "aws_ses" | "amazon_ses" => {
            if msg.http_auth.is_empty() {
                msg.http_auth = "aws_sigv4".to_string();
            }
            if msg.aws_region.is_empty() {
                msg.aws_region = infer_aws_region(&msg.endpoint);
            }
        }
        "postmark" => {
            if msg.http_auth.is_empty() {
                msg.http_auth = "api_key_header".to_string();
                msg.http_auth_header = "X-Postmark-Server-Token".to_string();
            }
        }
        "resend" | "sparkpost" => {
            if msg.http_auth.is_empty() {
                msg.http_auth = "bearer".to_string();
            }
        }
        _ => {}
    }

    // Per-provider connection scaling seeds for the shared client cache.
    match msg.provider.as_str() {
        "ses" | "aws_ses" | "amazon_ses" | "sendgrid" | "sparkpost" | "postmark" | "resend"
        | "mailgun" => {
            if msg.max_conns_per_host == 0 {
                msg.max_conns_per_host = 64;
            }
            if msg.max_idle_conns == 0 {
                msg.max_idle_conns = 200;
            }
            if msg.max_idle_conns_per_host == 0 {
                msg.max_idle_conns_per_host = 64;
            }
        }
        "brevo" | "sendinblue" | "mailtrap" => {
            if msg.max_conns_per_host == 0 {
                msg.max_conns_per_host = 32;
            }
            if msg.max_idle_conns == 0 {
                msg.max_idle_conns = 120;
            }
            if msg.max_idle_conns_per_host == 0 {
                msg.max_idle_conns_per_host = 32;
            }
        }
        _ => {}
    }

    for (key, template) in &profile.headers {
        if !msg.headers.contains_key(key) {
            msg.headers
                .insert(key.clone(), template.replace("${API_KEY}", &msg.api_key));
        }
    }
}

fn apply_http_scaling_defaults(msg: &mut Message) {
    if msg.transport != "http" {
        return;
    }
    if msg.max_conns_per_host == 0 {
        msg.max_conns_per_host = 32;
    }
    if msg.max_idle_conns == 0 {
        msg.max_idle_conns = 120;
    }
    if msg.max_idle_conns_per_host == 0 {
        msg.max_idle_conns_per_host = 32;
    }
}

/// Infer a provider name from the first address whose domain is mapped.
pub fn infer_provider(addresses: &[&str]) -> String {
    for raw in addresses {
        let (_, email) = split_address(raw);
        if email.is_empty() {
            continue;
        }
        let Some((_, domain)) = email.split_once('@') else {
            continue;
        };
        if let Some(provider) = provider_for_domain(domain) {
            return provider;
        }
    }
    String::new()
}

/// Pull an AWS region out of an SES-style endpoint hostname.
pub fn infer_aws_region(endpoint: &str) -> String {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    static GENERIC_RE: OnceLock<Regex> = OnceLock::new();

    let endpoint = endpoint.trim().to_ascii_lowercase();
    if endpoint.is_empty() {
        return String::new();
    }
    if endpoint.contains("email-") && endpoint.contains(".amazonaws.com") {
        let re = EMAIL_RE
            .get_or_init(|| Regex::new(r"email-([a-z0-9-]+)\.amazonaws\.com").expect("regex"));
        if let Some(caps) = re.captures(&endpoint) {
            return caps[1].to_string();
        }
    }
    let re =
        GENERIC_RE.get_or_init(|| Regex::new(r"\.([a-z0-9-]+)\.amazonaws\.com").expect("regex"));
    match re.captures(&endpoint) {
        Some(caps) => caps[1].to_string(),
        None => String::new(),
    }
}
