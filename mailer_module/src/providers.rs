//! Process-wide provider registries: transport defaults, HTTP profiles and
//! the sender-domain map. Seeded on first access, open to runtime
//! registration behind RwLocks.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Static per-provider settings: transport coordinates plus the capacity and
/// cost figures the usage-aware scorer reads.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub use_ssl: bool,
    pub transport: String,
    pub endpoint: String,
    /// Approximate sends per selection window; zero means unknown.
    pub capacity: u32,
    /// Relative cost metric; zero means unknown.
    pub cost: f64,
}

fn provider_defaults() -> &'static RwLock<HashMap<String, ProviderSettings>> {
    static DEFAULTS: OnceLock<RwLock<HashMap<String, ProviderSettings>>> = OnceLock::new();
    DEFAULTS.get_or_init(|| RwLock::new(seed_provider_defaults()))
}

fn seed_provider_defaults() -> HashMap<String, ProviderSettings> {
    let mut map = HashMap::new();
    let mut insert = |name: &str, settings: ProviderSettings| {
        map.insert(name.to_string(), settings);
    };
    insert(
        "sendgrid",
        ProviderSettings {
            host: "smtp.sendgrid.net".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            endpoint: "https://api.sendgrid.com/v3/mail/send".into(),
            capacity: 1000,
            cost: 0.5,
            ..ProviderSettings::default()
        },
    );
    insert(
        "resend",
        ProviderSettings {
            host: "smtp.resend.com".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            endpoint: "https://api.resend.com/emails".into(),
            capacity: 1000,
            cost: 0.3,
            ..ProviderSettings::default()
        },
    );
    insert(
        "postmark",
        ProviderSettings {
            host: "smtp.postmarkapp.com".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            endpoint: "https://api.postmarkapp.com/email".into(),
            capacity: 1000,
            cost: 0.4,
            ..ProviderSettings::default()
        },
    );
    insert(
        "mailgun",
        ProviderSettings {
            host: "smtp.mailgun.org".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            endpoint: "https://api.mailgun.net/v3".into(),
            capacity: 1000,
            cost: 0.4,
            ..ProviderSettings::default()
        },
    );
    insert(
        "aws_ses",
        ProviderSettings {
            host: "email-smtp.us-east-1.amazonaws.com".into(),
            port: 465,
            use_tls: true,
            transport: "smtp".into(),
            endpoint: "https://email.us-east-1.amazonaws.com".into(),
            capacity: 5000,
            cost: 0.1,
            ..ProviderSettings::default()
        },
    );
    insert(
        "smtp",
        ProviderSettings {
            host: "localhost".into(),
            port: 1025,
            transport: "smtp".into(),
            ..ProviderSettings::default()
        },
    );
    insert(
        "gmail",
        ProviderSettings {
            host: "smtp.gmail.com".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            capacity: 500,
            ..ProviderSettings::default()
        },
    );
    insert(
        "outlook",
        ProviderSettings {
            host: "smtp-mail.outlook.com".into(),
            port: 587,
            use_tls: true,
            transport: "smtp".into(),
            capacity: 500,
            ..ProviderSettings::default()
        },
    );
    // Local MailHog relay, handy for development and integration tests.
    insert(
        "mailhog",
        ProviderSettings {
            host: "localhost".into(),
            port: 1025,
            transport: "smtp".into(),
            ..ProviderSettings::default()
        },
    );
    map
}

/// Look up the default settings for a provider name (case-insensitive).
pub fn provider_default(name: &str) -> Option<ProviderSettings> {
    let key = name.trim().to_ascii_lowercase();
    provider_defaults()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .get(&key)
        .cloned()
}

/// Override or add provider defaults at runtime.
pub fn register_provider_default(name: &str, settings: ProviderSettings) {
    provider_defaults()
        .write()
        .unwrap_or_else(|err| err.into_inner())
        .insert(name.trim().to_ascii_lowercase(), settings);
}

/// Lightweight HTTP hints used to populate message configs.
#[derive(Debug, Clone, Default)]
pub struct HttpProviderProfile {
    pub endpoint: String,
    pub method: String,
    pub payload_format: String,
    pub content_type: String,
    /// Header templates; `${API_KEY}` expands to the message credential.
    pub headers: Vec<(String, String)>,
}

fn http_profiles() -> &'static RwLock<HashMap<String, HttpProviderProfile>> {
    static PROFILES: OnceLock<RwLock<HashMap<String, HttpProviderProfile>>> = OnceLock::new();
    PROFILES.get_or_init(|| RwLock::new(seed_http_profiles()))
}

fn seed_http_profiles() -> HashMap<String, HttpProviderProfile> {
    let mut map = HashMap::new();
    map.insert(
        "sendgrid".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.sendgrid.com/v3/mail/send".into(),
            method: "POST".into(),
            payload_format: "sendgrid".into(),
            content_type: "application/json".into(),
            headers: vec![("Authorization".into(), "Bearer ${API_KEY}".into())],
        },
    );
    map.insert(
        "resend".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.resend.com/emails".into(),
            method: "POST".into(),
            payload_format: "resend".into(),
            content_type: "application/json".into(),
            headers: vec![("Authorization".into(), "Bearer ${API_KEY}".into())],
        },
    );
    map.insert(
        "postmark".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.postmarkapp.com/email".into(),
            method: "POST".into(),
            payload_format: "postmark".into(),
            content_type: "application/json".into(),
            headers: vec![("X-Postmark-Server-Token".into(), "${API_KEY}".into())],
        },
    );
    map.insert(
        "mailgun".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.mailgun.net/v3".into(),
            method: "POST".into(),
            payload_format: "mailgun".into(),
            content_type: "application/x-www-form-urlencoded".into(),
            headers: vec![("Authorization".into(), "Basic ${API_KEY}".into())],
        },
    );
    map.insert(
        "brevo".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.brevo.com/v3/smtp/email".into(),
            method: "POST".into(),
            payload_format: "brevo".into(),
            content_type: "application/json".into(),
            headers: vec![
                ("accept".into(), "application/json".into()),
                ("api-key".into(), "${API_KEY}".into()),
            ],
        },
    );
    map.insert(
        "sparkpost".to_string(),
        HttpProviderProfile {
            endpoint: "https://api.sparkpost.com/api/v1/transmissions".into(),
            method: "POST".into(),
            payload_format: "sparkpost".into(),
            content_type: "application/json".into(),
            headers: vec![("Authorization".into(), "${API_KEY}".into())],
        },
    );
    map.insert(
        "mailtrap".to_string(),
        HttpProviderProfile {
            endpoint: "https://send.api.mailtrap.io/api/send".into(),
            method: "POST".into(),
            payload_format: "mailtrap".into(),
            content_type: "application/json".into(),
            headers: vec![("Api-Token".into(), "${API_KEY}".into())],
        },
    );
    map
}

pub fn http_profile(name: &str) -> Option<HttpProviderProfile> {
    let key = name.trim().to_ascii_lowercase();
    http_profiles()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .get(&key)
        .cloned()
}

pub fn register_http_profile(name: &str, profile: HttpProviderProfile) {
    http_profiles()
        .write()
        .unwrap_or_else(|err| err.into_inner())
        .insert(name.trim().to_ascii_lowercase(), profile);
}

fn email_domain_map() -> &'static RwLock<HashMap<String, String>> {
    static DOMAINS: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();
    DOMAINS.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("gmail.com".to_string(), "gmail".to_string());
        map.insert("googlemail.com".to_string(), "gmail".to_string());
        map.insert("yahoo.com".to_string(), "smtp".to_string());
        RwLock::new(map)
    })
}

/// Preferred provider for a sender domain, if one is mapped.
pub fn provider_for_domain(domain: &str) -> Option<String> {
    let key = domain.trim().to_ascii_lowercase();
    email_domain_map()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .get(&key)
        .cloned()
}

pub fn register_email_domain(domain: &str, provider: &str) {
    email_domain_map()
        .write()
        .unwrap_or_else(|err| err.into_inner())
        .insert(
            domain.trim().to_ascii_lowercase(),
            provider.trim().to_ascii_lowercase(),
        );
}
