use std::fmt;

use thiserror::Error;

/// Failure returned by an HTTP provider endpoint (status >= 300).
#[derive(Debug, Clone)]
pub struct ResponseFailure {
    pub status: u16,
    pub request_id: Option<String>,
    /// Response body truncated to 4 KiB.
    pub body: String,
}

impl fmt::Display for ResponseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_id.as_deref() {
            Some(id) => write!(
                f,
                "status={} request_id={} body={}",
                self.status, id, self.body
            ),
            None => write!(f, "status={} body={}", self.status, self.body),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid message: {0}")]
    Config(String),
    #[error("attachment error: {0}")]
    Attachment(String),
    #[error("payload error: {0}")]
    Payload(String),
    #[error("unsupported smtp auth {0}")]
    SmtpAuth(String),
    #[error("smtp send failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("message build failed: {0}")]
    MessageBuild(#[from] lettre::error::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http send failed: {0}")]
    Response(ResponseFailure),
    #[error("sigv4 signing failed: {0}")]
    Signing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
