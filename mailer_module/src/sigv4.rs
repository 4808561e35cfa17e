//! AWS Signature V4 request signing for the SES HTTP API.

use std::collections::BTreeMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, HOST};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::infer_aws_region;
use crate::error::MailError;
use crate::message::Message;

const SERVICE: &str = "ses";

pub fn sign_aws_v4(
    method: &str,
    url: &Url,
    headers: &mut HeaderMap,
    body: &[u8],
    msg: &Message,
) -> Result<(), MailError> {
    let mut region = msg.aws_region.trim().to_string();
    if region.is_empty() {
        region = infer_aws_region(url.as_str());
    }
    if region.is_empty() {
        return Err(MailError::Signing("aws region required".to_string()));
    }
    let access = msg.aws_access_key.trim();
    let secret = msg.aws_secret_key.trim();
    if access.is_empty() || secret.is_empty() {
        return Err(MailError::Signing("aws credentials required".to_string()));
    }

    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(body);

    let host = url
        .host_str()
        .map(|h| match url.port() {
            Some(port) => format!("{h}:{port}"),
            None => h.to_string(),
        })
        .ok_or_else(|| MailError::Signing("endpoint has no host".to_string()))?;
    if !headers.contains_key(HOST) {
        headers.insert(HOST, header_value(&host)?);
    }
    headers.insert("x-amz-date", header_value(&amz_date)?);
    headers.insert("x-amz-content-sha256", header_value(&payload_hash)?);
    if !msg.aws_session_token.is_empty() {
        headers.insert("x-amz-security-token", header_value(&msg.aws_session_token)?);
    }

    let (canonical_headers, signed_headers) = canonicalize_headers(headers);
    let canonical_request = [
        method,
        canonical_uri(url.path()).as_str(),
        canonical_query(url).as_str(),
        canonical_headers.as_str(),
        signed_headers.as_str(),
        payload_hash.as_str(),
    ]
    .join("\n");

    let credential_scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = [
        "AWS4-HMAC-SHA256",
        amz_date.as_str(),
        credential_scope.as_str(),
        sha256_hex(canonical_request.as_bytes()).as_str(),
    ]
    .join("\n");

    let signing_key = derive_signing_key(secret, &date_stamp, &region)?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);
    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );
    headers.insert(AUTHORIZATION, header_value(&authorization)?);
    Ok(())
}

fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", escape_query(key), escape_query(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn escape_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn canonicalize_headers(headers: &HeaderMap) -> (String, String) {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        grouped
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(value.to_str().unwrap_or_default().trim().to_string());
    }
    let mut canonical = String::new();
    let mut signed = Vec::with_capacity(grouped.len());
    for (name, values) in &grouped {
        signed.push(name.clone());
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(&values.join(","));
        canonical.push('\n');
    }
    (canonical, signed.join(";"))
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Result<Vec<u8>, MailError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, MailError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|err| MailError::Signing(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn header_value(value: &str) -> Result<HeaderValue, MailError> {
    HeaderValue::from_str(value)
        .map_err(|err| MailError::Signing(format!("invalid header value: {err}")))
}
