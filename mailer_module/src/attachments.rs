//! Attachment loading and encoding. Sources may be local paths, `data:`
//! URIs, or http(s) URLs.

use std::fs;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::error::MailError;
use crate::message::{looks_like_url, Attachment, Message};

/// An attachment resolved to bytes, ready for payload or MIME assembly.
#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub inline: bool,
    pub content_id: String,
}

impl LoadedAttachment {
    /// Base64 form used by JSON provider payloads.
    pub fn base64_content(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }
}

/// Resolve every attachment on the message.
pub fn load_all_attachments(msg: &Message) -> Result<Vec<LoadedAttachment>, MailError> {
    let mut loaded = Vec::with_capacity(msg.attachments.len());
    for att in &msg.attachments {
        loaded.push(load_attachment(att)?);
    }
    Ok(loaded)
}

pub fn load_attachment(att: &Attachment) -> Result<LoadedAttachment, MailError> {
    let source = att.source.trim();
    if source.is_empty() {
        return Err(MailError::Attachment(
            "attachment source is required".to_string(),
        ));
    }

    let (data, detected_mime, detected_name) = if source.starts_with("data:") {
        decode_data_uri(source)?
    } else if looks_like_url(source) {
        download_attachment(source)?
    } else {
        let data = fs::read(source)
            .map_err(|err| MailError::Attachment(format!("read {source}: {err}")))?;
        let name = source
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(source)
            .to_string();
        (data, String::new(), name)
    };

    let filename = if !att.name.trim().is_empty() {
        att.name.trim().to_string()
    } else if !detected_name.is_empty() {
        detected_name
    } else {
        "attachment".to_string()
    };
    let mime_type = if !att.mime_type.trim().is_empty() {
        att.mime_type.trim().to_string()
    } else if !detected_mime.is_empty() {
        detected_mime
    } else {
        detect_mime_type(&filename)
    };

    Ok(LoadedAttachment {
        filename,
        mime_type,
        data,
        inline: att.inline,
        content_id: att.content_id.trim().to_string(),
    })
}

fn decode_data_uri(uri: &str) -> Result<(Vec<u8>, String, String), MailError> {
    let rest = &uri["data:".len()..];
    let Some((header, payload)) = rest.split_once(',') else {
        return Err(MailError::Attachment("malformed data uri".to_string()));
    };
    let mut mime = String::new();
    let mut is_base64 = false;
    for part in header.split(';') {
        if part.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if !part.is_empty() && mime.is_empty() {
            mime = part.to_string();
        }
    }
    let data = if is_base64 {
        BASE64_STANDARD
            .decode(payload.trim())
            .map_err(|err| MailError::Attachment(format!("data uri decode: {err}")))?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok((data, mime, String::new()))
}

fn download_attachment(link: &str) -> Result<(Vec<u8>, String, String), MailError> {
    let response = reqwest::blocking::Client::new().get(link).send()?;
    if !response.status().is_success() {
        return Err(MailError::Attachment(format!(
            "download {link}: status {}",
            response.status()
        )));
    }
    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default();
    let name = filename_from_url(link);
    let data = response.bytes()?.to_vec();
    Ok((data, mime, name))
}

fn filename_from_url(link: &str) -> String {
    url::Url::parse(link)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_default()
}

/// Extension-based MIME sniffing for the handful of types transactional
/// mail actually carries.
pub fn detect_mime_type(filename: &str) -> String {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "ics" => "text/calendar",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

/// Split into (inline, regular) sets; inline parts ride in the related body
/// section, regular parts in the mixed envelope.
pub fn partition_attachments(list: &[LoadedAttachment]) -> (Vec<LoadedAttachment>, Vec<LoadedAttachment>) {
    let mut inline = Vec::new();
    let mut regular = Vec::new();
    for att in list {
        if att.inline {
            inline.push(att.clone());
        } else {
            regular.push(att.clone());
        }
    }
    (inline, regular)
}
