//! HTTP delivery: payload encoding, auth header application, a process-wide
//! blocking client cache, and failure surfacing with provider request ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use tracing::info;
use url::Url;

use crate::error::{MailError, ResponseFailure};
use crate::message::Message;
use crate::payloads::{resolve_http_payload, PayloadBody};
use crate::sigv4::sign_aws_v4;

const RESPONSE_BODY_CAP: usize = 4096;

pub fn send_via_http(msg: &Message) -> Result<(), MailError> {
    if msg.endpoint.is_empty() {
        return Err(MailError::Config("http endpoint is required".to_string()));
    }
    let mut url = Url::parse(&msg.endpoint)
        .map_err(|err| MailError::Config(format!("endpoint {}: {err}", msg.endpoint)))?;
    apply_query_params(&mut url, msg);

    let (payload, content_type) = resolve_http_payload(msg)?;
    let (body, body_type) = encode_payload(payload, &content_type)?;

    let method = if msg.http_method.is_empty() {
        Method::POST
    } else {
        Method::from_bytes(msg.http_method.as_bytes())
            .map_err(|err| MailError::Config(format!("http method {}: {err}", msg.http_method)))?
    };

    let mut headers = HeaderMap::new();
    if !body_type.is_empty() {
        headers.insert(CONTENT_TYPE, parse_header_value(&body_type)?);
    }
    for (key, value) in &msg.headers {
        headers.insert(parse_header_name(key)?, parse_header_value(value)?);
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    apply_auth_headers(&mut headers, &mut url, msg, &body)?;

    let client = cached_client(msg)?;
    let response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()?;

    let status = response.status();
    let request_id = response
        .headers()
        .get("x-amzn-requestid")
        .or_else(|| response.headers().get("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if status.as_u16() >= 300 {
        let mut body = response.text().unwrap_or_default();
        body.truncate(RESPONSE_BODY_CAP);
        return Err(MailError::Response(ResponseFailure {
            status: status.as_u16(),
            request_id,
            body: body.trim().to_string(),
        }));
    }
    if let Some(id) = request_id {
        info!(request_id = %id, "http send ok");
    }
    Ok(())
}

fn apply_query_params(url: &mut Url, msg: &Message) {
    if msg.query_params.is_empty() {
        return;
    }
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    for (key, value) in &msg.query_params {
        match pairs.iter_mut().find(|(existing, _)| existing == key) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }
    let mut serializer = url.query_pairs_mut();
    serializer.clear();
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    drop(serializer);
}

/// Encode the payload to bytes, defaulting the content type by payload
/// family when the caller did not pin one.
pub fn encode_payload(payload: PayloadBody, content_type: &str) -> Result<(Vec<u8>, String), MailError> {
    let (bytes, default_type) = match payload {
        PayloadBody::Json(value) => (serde_json::to_vec(&value)?, "application/json"),
        PayloadBody::Form(pairs) => {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            (encoded.into_bytes(), "application/x-www-form-urlencoded")
        }
        PayloadBody::Raw(bytes) => (bytes, "application/octet-stream"),
    };
    let final_type = if content_type.trim().is_empty() {
        default_type.to_string()
    } else {
        content_type.to_string()
    };
    Ok((bytes, final_type))
}

/// Attach credentials: the explicit `http_auth` policy wins, then known
/// provider conventions, then a bearer default when a token exists.
fn apply_auth_headers(
    headers: &mut HeaderMap,
    url: &mut Url,
    msg: &Message,
    body: &[u8],
) -> Result<(), MailError> {
    let api_key = msg.api_key.trim();
    let mut token = msg.api_token.trim();
    if token.is_empty() {
        token = api_key;
    }

    match msg.http_auth.as_str() {
        "none" => return Ok(()),
        "basic" => {
            if !msg.username.is_empty() || !msg.password.is_empty() {
                set_basic_auth(headers, &msg.username, &msg.password)?;
                return Ok(());
            }
        }
        "bearer" => {
            if !token.is_empty() {
                if !headers.contains_key(AUTHORIZATION) {
                    let value = format!("{} {token}", msg.http_auth_prefix);
                    headers.insert(AUTHORIZATION, parse_header_value(value.trim())?);
                }
                return Ok(());
            }
        }
        "api_key_header" => {
            let header = if msg.http_auth_header.is_empty() {
                "X-API-Key"
            } else {
                msg.http_auth_header.as_str()
            };
            if !token.is_empty() {
                let name = parse_header_name(header)?;
                if !headers.contains_key(&name) {
                    headers.insert(name, parse_header_value(token)?);
                }
            }
            return Ok(());
        }
        "api_key_query" => {
            let param = if msg.http_auth_query.is_empty() {
                "api_key"
            } else {
                msg.http_auth_query.as_str()
            };
            if !token.is_empty()
                && !url.query_pairs().any(|(key, _)| key == param)
            {
                url.query_pairs_mut().append_pair(param, token);
            }
            return Ok(());
        }
        "aws_sigv4" => return sign_aws_v4(method_str(msg), &*url, headers, body, msg),
        _ => {}
    }

    match msg.provider.as_str() {
        "brevo" | "sendinblue" => {
            let key = if api_key.is_empty() { token } else { api_key };
            if !key.is_empty() && !headers.contains_key("api-key") {
                headers.insert("api-key", parse_header_value(key)?);
            }
            return Ok(());
        }
        "mailgun" => {
            if !token.is_empty() {
                set_basic_auth(headers, "api", token)?;
            }
            return Ok(());
        }
        "postmark" => {
            if !token.is_empty() && !headers.contains_key("X-Postmark-Server-Token") {
                headers.insert("X-Postmark-Server-Token", parse_header_value(token)?);
            }
            return Ok(());
        }
        "sparkpost" => {
            if !token.is_empty() && !headers.contains_key(AUTHORIZATION) {
                headers.insert(AUTHORIZATION, parse_header_value(token)?);
            }
            return Ok(());
        }
        "resend" => {
            if !token.is_empty() && !headers.contains_key(AUTHORIZATION) {
                headers.insert(AUTHORIZATION, parse_header_value(&format!("Bearer {token}"))?);
            }
            return Ok(());
        }
        "ses" | "aws_ses" | "amazon_ses" => {
            return sign_aws_v4(method_str(msg), &*url, headers, body, msg)
        }
        _ => {}
    }

    if !token.is_empty() && !headers.contains_key(AUTHORIZATION) {
        let value = format!("{} {token}", msg.http_auth_prefix);
        headers.insert(AUTHORIZATION, parse_header_value(value.trim())?);
    }
    Ok(())
}

fn method_str(msg: &Message) -> &str {
    if msg.http_method.is_empty() {
        "POST"
    } else {
        msg.http_method.as_str()
    }
}

fn set_basic_auth(headers: &mut HeaderMap, user: &str, pass: &str) -> Result<(), MailError> {
    let encoded = BASE64_STANDARD.encode(format!("{user}:{pass}"));
    headers.insert(AUTHORIZATION, parse_header_value(&format!("Basic {encoded}"))?);
    Ok(())
}

fn parse_header_name(key: &str) -> Result<HeaderName, MailError> {
    HeaderName::from_bytes(key.as_bytes())
        .map_err(|err| MailError::Config(format!("invalid header {key}: {err}")))
}

fn parse_header_value(value: &str) -> Result<HeaderValue, MailError> {
    HeaderValue::from_str(value)
        .map_err(|err| MailError::Config(format!("invalid header value: {err}")))
}

/// Shared blocking clients keyed by connection-shaping knobs, so repeated
/// sends to the same provider reuse pooled connections.
fn cached_client(msg: &Message) -> Result<Arc<Client>, MailError> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Client>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    let key = client_key(msg);
    let mut cache = cache.lock().unwrap_or_else(|err| err.into_inner());
    if let Some(client) = cache.get(&key) {
        return Ok(client.clone());
    }
    let mut builder = Client::builder()
        .timeout(msg.timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .danger_accept_invalid_certs(msg.skip_tls_verify);
    if msg.max_idle_conns_per_host > 0 {
        builder = builder.pool_max_idle_per_host(msg.max_idle_conns_per_host as usize);
    }
    if msg.disable_keepalives {
        builder = builder.pool_max_idle_per_host(0);
    }
    let client = Arc::new(builder.build()?);
    cache.insert(key, client.clone());
    Ok(client)
}

fn client_key(msg: &Message) -> String {
    let host = Url::parse(&msg.endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| msg.host.clone());
    format!(
        "host-{host}-tls-{}-idlehost-{}-noka-{}-timeout-{}",
        msg.skip_tls_verify,
        msg.max_idle_conns_per_host,
        msg.disable_keepalives,
        msg.timeout.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_payload_defaults_content_types() {
        let (bytes, ct) = encode_payload(PayloadBody::Json(json!({"a": 1})), "").expect("json");
        assert_eq!(bytes, b"{\"a\":1}");
        assert_eq!(ct, "application/json");

        let (bytes, ct) = encode_payload(
            PayloadBody::Form(vec![("to".to_string(), "a b@c".to_string())]),
            "",
        )
        .expect("form");
        assert_eq!(String::from_utf8_lossy(&bytes), "to=a+b%40c");
        assert_eq!(ct, "application/x-www-form-urlencoded");

        let (_, ct) = encode_payload(PayloadBody::Raw(vec![1, 2]), "message/rfc822").expect("raw");
        assert_eq!(ct, "message/rfc822");
    }

    #[test]
    fn bearer_auth_sets_authorization() {
        let msg = Message {
            http_auth: "bearer".to_string(),
            http_auth_prefix: "Bearer".to_string(),
            api_token: "tok123".to_string(),
            ..Message::default()
        };
        let mut headers = HeaderMap::new();
        let mut url = Url::parse("https://api.example.com/send").expect("url");
        apply_auth_headers(&mut headers, &mut url, &msg, b"").expect("auth");
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer tok123")
        );
    }

    #[test]
    fn api_key_query_appends_param() {
        let msg = Message {
            http_auth: "api_key_query".to_string(),
            api_key: "k".to_string(),
            ..Message::default()
        };
        let mut headers = HeaderMap::new();
        let mut url = Url::parse("https://api.example.com/send").expect("url");
        apply_auth_headers(&mut headers, &mut url, &msg, b"").expect("auth");
        assert_eq!(url.query(), Some("api_key=k"));
    }

    #[test]
    fn mailgun_fallback_uses_basic_auth() {
        let msg = Message {
            provider: "mailgun".to_string(),
            api_key: "mg-secret".to_string(),
            ..Message::default()
        };
        let mut headers = HeaderMap::new();
        let mut url = Url::parse("https://api.mailgun.net/v3/acme/messages").expect("url");
        apply_auth_headers(&mut headers, &mut url, &msg, b"").expect("auth");
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .expect("authorization");
        assert_eq!(
            value,
            format!("Basic {}", BASE64_STANDARD.encode("api:mg-secret"))
        );
    }

    #[test]
    fn sends_against_mock_endpoint() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/send")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create();
        let mut msg = Message {
            from: "noreply@acme.example".to_string(),
            to: vec!["user@example.com".to_string()],
            subject: "Hi".to_string(),
            transport: "http".to_string(),
            endpoint: format!("{}/send", server.url()),
            timeout: Duration::from_secs(5),
            ..Message::default()
        };
        msg.text_body = "hello".to_string();
        send_via_http(&msg).expect("send");
        mock.assert();
    }

    #[test]
    fn surfaces_status_and_request_id_on_failure() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/send")
            .with_status(422)
            .with_header("x-request-id", "req-9")
            .with_body("unprocessable")
            .create();
        let msg = Message {
            from: "noreply@acme.example".to_string(),
            to: vec!["user@example.com".to_string()],
            transport: "http".to_string(),
            endpoint: format!("{}/send", server.url()),
            timeout: Duration::from_secs(5),
            text_body: "hello".to_string(),
            ..Message::default()
        };
        let err = send_via_http(&msg).expect_err("must fail");
        match err {
            MailError::Response(failure) => {
                assert_eq!(failure.status, 422);
                assert_eq!(failure.request_id.as_deref(), Some("req-9"));
                assert_eq!(failure.body, "unprocessable");
            }
            other => panic!("expected response failure, got {other}"),
        }
    }
}
