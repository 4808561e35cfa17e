//! Message model and delivery collaborators for mailflow: the normalized
//! [`Message`], provider registries, placeholder resolution, MIME assembly,
//! and the SMTP/HTTP send surface the dispatch pipeline drives.

pub mod attachments;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod mime;
pub mod payloads;
pub mod placeholders;
pub mod providers;
pub mod sigv4;
pub mod smtp;

pub use config::{apply_http_profile, apply_provider_defaults, finalize_message};
pub use error::{MailError, ResponseFailure};
pub use message::{
    extract_domain, split_address, Attachment, Message, ProviderRoute, ScheduleMode,
};
pub use placeholders::apply_placeholders;
pub use providers::{
    provider_default, register_email_domain, register_http_profile, register_provider_default,
    HttpProviderProfile, ProviderSettings,
};

/// Hand a finalized message to its transport collaborator.
pub fn deliver(msg: &Message) -> Result<(), MailError> {
    if msg.transport == "http" {
        http::send_via_http(msg)
    } else {
        smtp::send_via_smtp(msg)
    }
}
