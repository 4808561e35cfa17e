use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Serialize durations as whole seconds so the on-disk job format stays
/// plain JSON numbers.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if secs <= 0.0 {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Whether a message may be delivered more than once.
///
/// `Once` turns on dedup fingerprinting; `Repeat` (the default) sends
/// unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    Once,
    #[default]
    Repeat,
}

/// A file to include with the email. `source` may be a filesystem path, a
/// `data:` URI, or an http(s) URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub source: String,
    pub name: String,
    pub mime_type: String,
    pub inline: bool,
    pub content_id: String,
}

/// A conditional routing rule choosing providers for matching messages.
///
/// A route with no to-domain, from-domain, or subject condition never
/// matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRoute {
    #[serde(alias = "to_domain")]
    pub to_domains: Vec<String>,
    #[serde(alias = "from_domain")]
    pub from_domains: Vec<String>,
    pub subject_regex: String,
    /// Ordered providers to try when this route matches.
    pub provider_priority: Vec<String>,
    /// Single-provider shortcut when `provider_priority` is omitted.
    pub provider: String,
    pub hourly_limit: u32,
    pub daily_limit: u32,
    pub weekly_limit: u32,
    pub monthly_limit: u32,
    /// Lookback window for usage-based selection, in seconds. Zero means the
    /// 24 h default.
    #[serde(with = "duration_secs")]
    pub selection_window: Duration,
    /// Exponential-decay half-life for recency weighting, in seconds. Zero
    /// falls back to window/4 with a 1 h floor.
    #[serde(with = "duration_secs")]
    pub recency_half_life: Duration,
    /// Relative weight per provider; higher weight penalizes selection.
    pub provider_weights: BTreeMap<String, f64>,
    /// Per-route capacity overrides.
    pub provider_capacities: BTreeMap<String, u32>,
    /// Per-route cost overrides.
    #[serde(rename = "provider_costs")]
    pub provider_cost_overrides: BTreeMap<String, f64>,
}

impl ProviderRoute {
    /// True when the route carries scoring hints that should influence an
    /// explicit provider-priority list.
    pub fn has_selection_metadata(&self) -> bool {
        !self.provider_weights.is_empty()
            || !self.provider_capacities.is_empty()
            || !self.provider_cost_overrides.is_empty()
            || !self.selection_window.is_zero()
            || !self.recency_half_life.is_zero()
    }

    /// Providers this route can send through, for limit accounting.
    pub fn providers(&self) -> Vec<String> {
        if !self.provider_priority.is_empty() {
            self.provider_priority.clone()
        } else if !self.provider.is_empty() {
            vec![self.provider.clone()]
        } else {
            Vec::new()
        }
    }
}

/// The normalized dispatch unit. Constructed from JSON config by the
/// caller, finalized by [`crate::config::finalize_message`], and treated as
/// a value by the pipeline: clones are free to rewrite `provider` and the
/// transport coordinates per attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub from: String,
    pub from_name: String,
    pub envelope_from: String,
    pub return_path: String,
    pub reply_to: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub list_unsubscribe: Vec<String>,
    pub list_unsubscribe_post: bool,
    pub subject: String,
    pub body: String,
    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
    pub configuration_set: String,
    pub tags: BTreeMap<String, String>,

    pub provider: String,
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub api_key: String,
    pub api_token: String,
    pub endpoint: String,
    pub http_method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub http_payload: Option<Map<String, Value>>,
    pub payload_format: String,
    pub http_content_type: String,
    pub http_auth: String,
    pub http_auth_header: String,
    pub http_auth_query: String,
    pub http_auth_prefix: String,
    pub max_conns_per_host: u32,
    pub max_idle_conns: u32,
    pub max_idle_conns_per_host: u32,
    pub disable_keepalives: bool,
    pub smtp_auth: String,

    pub aws_region: String,
    pub aws_access_key: String,
    pub aws_secret_key: String,
    pub aws_session_token: String,

    pub use_tls: bool,
    pub use_ssl: bool,
    pub skip_tls_verify: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub retry_count: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    /// Caps exponential backoff; zero disables the cap.
    #[serde(with = "duration_secs")]
    pub max_retry_delay: Duration,

    /// Ordered provider names to attempt on failure.
    pub provider_priority: Vec<String>,
    #[serde(rename = "routes")]
    pub provider_routes: Vec<ProviderRoute>,
    pub schedule_mode: ScheduleMode,
    /// When true the dispatcher logs the plan instead of sending.
    pub dry_run: bool,
    pub additional_data: Map<String, Value>,

    // Template copies captured before placeholder resolution so scheduled
    // sends can re-resolve against per-step data. Not persisted.
    #[serde(skip)]
    pub raw_subject: String,
    #[serde(skip)]
    pub raw_body: String,
    #[serde(skip)]
    pub raw_text_body: String,
    #[serde(skip)]
    pub raw_html_body: String,
}

impl Message {
    /// Provider name for logging, falling back to the SMTP host.
    pub fn provider_or_host(&self) -> String {
        if !self.provider.is_empty() {
            self.provider.clone()
        } else {
            self.host.clone()
        }
    }

    pub fn transport_details(&self) -> String {
        if self.transport == "http" {
            self.endpoint.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Settle text/html bodies from the generic `body` field. The base body
    /// becomes the HTML body when it looks like markup, otherwise the text
    /// body; an entirely blank message gets the `(empty message)` stand-in.
    pub fn resolve_bodies(&mut self) {
        let mut text = self.text_body.trim().to_string();
        let mut html = self.html_body.trim().to_string();
        let base = self.body.trim().to_string();

        if html.is_empty() && looks_like_html(&base) {
            html = base.clone();
        }
        if text.is_empty() {
            if html.is_empty() {
                text = base.clone();
            } else if !base.is_empty() && !looks_like_html(&base) {
                text = base;
            }
        }
        if text.is_empty() && html.is_empty() {
            text = "(empty message)".to_string();
        }

        self.text_body = text;
        self.html_body = html;
    }

    pub fn capture_raw_content(&mut self) {
        self.raw_subject = self.subject.clone();
        self.raw_body = self.body.clone();
        self.raw_text_body = self.text_body.clone();
        self.raw_html_body = self.html_body.clone();
    }

    pub fn restore_raw_content(&mut self) {
        if !self.raw_subject.is_empty() {
            self.subject = self.raw_subject.clone();
        }
        if !self.raw_body.is_empty() {
            self.body = self.raw_body.clone();
        }
        if !self.raw_text_body.is_empty() {
            self.text_body = self.raw_text_body.clone();
        }
        if !self.raw_html_body.is_empty() {
            self.html_body = self.raw_html_body.clone();
        }
    }
}

/// Split a `Display Name <address>` form into (name, address). Values
/// without angle brackets come back as a bare address.
pub fn split_address(value: &str) -> (String, String) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (String::new(), String::new());
    }
    if let (Some(open), true) = (trimmed.find('<'), trimmed.ends_with('>')) {
        let name = trimmed[..open].trim().trim_matches('"').to_string();
        let addr = trimmed[open + 1..trimmed.len() - 1].trim().to_string();
        return (name, addr);
    }
    (String::new(), trimmed.to_string())
}

/// Lowercased domain portion of an address, or empty when there is none.
pub fn extract_domain(addr: &str) -> String {
    let addr = addr.trim();
    match addr.rfind('@') {
        Some(idx) if idx < addr.len() - 1 => addr[idx + 1..].trim().to_ascii_lowercase(),
        _ => String::new(),
    }
}

pub fn looks_like_html(body: &str) -> bool {
    let body = body.trim();
    body.starts_with('<') && body.contains('>')
}

pub fn looks_like_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_address_handles_display_name() {
        let (name, addr) = split_address("Acme Billing <billing@acme.example>");
        assert_eq!(name, "Acme Billing");
        assert_eq!(addr, "billing@acme.example");

        let (name, addr) = split_address("user@example.com");
        assert_eq!(name, "");
        assert_eq!(addr, "user@example.com");
    }

    #[test]
    fn extract_domain_is_case_insensitive() {
        let (_, addr) = split_address("User <user@GMAIL.com>");
        assert_eq!(extract_domain(&addr), "gmail.com");
        assert_eq!(extract_domain("user@Gmail.Com"), "gmail.com");
        assert_eq!(extract_domain("no-at-sign"), "");
    }

    #[test]
    fn resolve_bodies_routes_html_base() {
        let mut msg = Message {
            body: "<p>Hello</p>".to_string(),
            ..Message::default()
        };
        msg.resolve_bodies();
        assert_eq!(msg.html_body, "<p>Hello</p>");
        assert_eq!(msg.text_body, "");
    }

    #[test]
    fn resolve_bodies_defaults_empty_message() {
        let mut msg = Message::default();
        msg.resolve_bodies();
        assert_eq!(msg.text_body, "(empty message)");
        assert_eq!(msg.html_body, "");
    }

    #[test]
    fn route_without_conditions_has_no_selection_metadata() {
        let route = ProviderRoute::default();
        assert!(!route.has_selection_metadata());
        let route = ProviderRoute {
            selection_window: Duration::from_secs(3600),
            ..ProviderRoute::default()
        };
        assert!(route.has_selection_metadata());
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message {
            from: "noreply@acme.example".to_string(),
            to: vec!["user@example.com".to_string()],
            subject: "Hi".to_string(),
            timeout: Duration::from_secs(30),
            schedule_mode: ScheduleMode::Once,
            ..Message::default()
        };
        let encoded = serde_json::to_string(&msg).expect("encode");
        let decoded: Message = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.from, msg.from);
        assert_eq!(decoded.timeout, Duration::from_secs(30));
        assert_eq!(decoded.schedule_mode, ScheduleMode::Once);
    }
}
