//! Provider-specific HTTP payload construction. Builders register by
//! payload format or provider name; unknown providers fall back to a
//! generic JSON shape.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::attachments::load_all_attachments;
use crate::error::MailError;
use crate::message::{split_address, Message};
use crate::mime::build_mime_message;

/// Encoded request body plus the content type it implies.
#[derive(Debug, Clone)]
pub enum PayloadBody {
    Json(Value),
    Form(Vec<(String, String)>),
    Raw(Vec<u8>),
}

pub type PayloadBuilder = fn(&Message) -> Result<(PayloadBody, &'static str), MailError>;

fn builders() -> &'static RwLock<HashMap<String, PayloadBuilder>> {
    static BUILDERS: OnceLock<RwLock<HashMap<String, PayloadBuilder>>> = OnceLock::new();
    BUILDERS.get_or_init(|| {
        let mut map: HashMap<String, PayloadBuilder> = HashMap::new();
        map.insert("json".into(), build_generic_json);
        map.insert("form".into(), build_generic_form);
        map.insert("sendgrid".into(), build_sendgrid);
        map.insert("resend".into(), build_resend);
        map.insert("postmark".into(), build_postmark);
        map.insert("mailgun".into(), build_mailgun);
        map.insert("brevo".into(), build_brevo);
        map.insert("sendinblue".into(), build_brevo);
        map.insert("sparkpost".into(), build_sparkpost);
        map.insert("mailtrap".into(), build_mailtrap);
        map.insert("ses".into(), build_ses_raw);
        map.insert("aws_ses".into(), build_ses_raw);
        map.insert("amazon_ses".into(), build_ses_raw);
        RwLock::new(map)
    })
}

pub fn register_payload_builder(name: &str, builder: PayloadBuilder) {
    builders()
        .write()
        .unwrap_or_else(|err| err.into_inner())
        .insert(name.trim().to_ascii_lowercase(), builder);
}

fn builder_for(name: &str) -> Option<PayloadBuilder> {
    builders()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .get(&name.trim().to_ascii_lowercase())
        .copied()
}

/// Pick the payload for a finalized message: explicit override first, then
/// the registered builder for the payload format, then the provider, then
/// the generic JSON shape.
pub fn resolve_http_payload(msg: &Message) -> Result<(PayloadBody, String), MailError> {
    if let Some(payload) = &msg.http_payload {
        return Ok((
            PayloadBody::Json(Value::Object(payload.clone())),
            msg.http_content_type.clone(),
        ));
    }
    let builder = [msg.payload_format.as_str(), msg.provider.as_str()]
        .into_iter()
        .filter(|name| !name.is_empty())
        .find_map(builder_for)
        .unwrap_or(build_generic_json);
    let (body, content_type) = builder(msg)?;
    let content_type = if msg.http_content_type.trim().is_empty() {
        content_type.to_string()
    } else {
        msg.http_content_type.clone()
    };
    Ok((body, content_type))
}

#[derive(Debug, Clone, Default)]
struct SimpleAddress {
    name: String,
    email: String,
}

fn parse_address_list(values: &[String]) -> Vec<SimpleAddress> {
    values
        .iter()
        .filter_map(|raw| {
            let (name, addr) = split_address(raw);
            if addr.is_empty() {
                None
            } else {
                Some(SimpleAddress { name, email: addr })
            }
        })
        .collect()
}

fn first_address_entry(values: &[String]) -> SimpleAddress {
    parse_address_list(values).into_iter().next().unwrap_or_default()
}

fn address_values(addresses: &[SimpleAddress]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|addr| {
                let mut entry = Map::new();
                entry.insert("email".to_string(), json!(addr.email));
                if !addr.name.is_empty() {
                    entry.insert("name".to_string(), json!(addr.name));
                }
                Value::Object(entry)
            })
            .collect(),
    )
}

fn single_address_value(addr: &SimpleAddress) -> Value {
    let mut entry = Map::new();
    entry.insert("email".to_string(), json!(addr.email));
    if !addr.name.is_empty() {
        entry.insert("name".to_string(), json!(addr.name));
    }
    Value::Object(entry)
}

fn fallback_body(value: &str) -> String {
    if value.trim().is_empty() {
        "(empty message)".to_string()
    } else {
        value.to_string()
    }
}

fn merge_additional(payload: &mut Map<String, Value>, extras: &Map<String, Value>, overwrite: bool) {
    for (key, value) in extras {
        if !overwrite && payload.contains_key(key) {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
}

fn build_sendgrid(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut personalization = Map::new();
    personalization.insert(
        "to".to_string(),
        address_values(&parse_address_list(&msg.to)),
    );
    if !msg.cc.is_empty() {
        personalization.insert(
            "cc".to_string(),
            address_values(&parse_address_list(&msg.cc)),
        );
    }
    if !msg.bcc.is_empty() {
        personalization.insert(
            "bcc".to_string(),
            address_values(&parse_address_list(&msg.bcc)),
        );
    }
    if !msg.subject.is_empty() {
        personalization.insert("subject".to_string(), json!(msg.subject));
    }

    let from = first_address_entry(&[format_sender(msg)]);
    let mut contents = Vec::new();
    if !msg.text_body.is_empty() {
        contents.push(json!({"type": "text/plain", "value": msg.text_body}));
    }
    if !msg.html_body.is_empty() {
        contents.push(json!({"type": "text/html", "value": msg.html_body}));
    }
    if contents.is_empty() {
        contents.push(json!({"type": "text/plain", "value": fallback_body(&msg.text_body)}));
    }

    let mut payload = Map::new();
    payload.insert(
        "personalizations".to_string(),
        Value::Array(vec![Value::Object(personalization)]),
    );
    payload.insert("from".to_string(), single_address_value(&from));
    payload.insert("content".to_string(), Value::Array(contents));

    let reply = first_address_entry(&msg.reply_to);
    if !reply.email.is_empty() {
        payload.insert("reply_to".to_string(), single_address_value(&reply));
    }

    let encoded = load_all_attachments(msg)?;
    if !encoded.is_empty() {
        let attachments = encoded
            .iter()
            .map(|att| {
                let mut entry = Map::new();
                entry.insert("content".to_string(), json!(att.base64_content()));
                entry.insert("type".to_string(), json!(att.mime_type));
                entry.insert("filename".to_string(), json!(att.filename));
                if att.inline {
                    entry.insert("disposition".to_string(), json!("inline"));
                    if !att.content_id.is_empty() {
                        entry.insert("content_id".to_string(), json!(att.content_id));
                    }
                }
                Value::Object(entry)
            })
            .collect();
        payload.insert("attachments".to_string(), Value::Array(attachments));
    }

    merge_additional(&mut payload, &msg.additional_data, true);
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_resend(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut payload = Map::new();
    payload.insert("from".to_string(), json!(format_sender(msg)));
    payload.insert("to".to_string(), json!(msg.to));
    payload.insert("subject".to_string(), json!(msg.subject));
    if !msg.html_body.is_empty() {
        payload.insert("html".to_string(), json!(msg.html_body));
    }
    if !msg.text_body.is_empty() {
        payload.insert("text".to_string(), json!(msg.text_body));
    }
    if msg.text_body.is_empty() && msg.html_body.is_empty() {
        payload.insert("text".to_string(), json!(fallback_body(&msg.text_body)));
    }
    if !msg.cc.is_empty() {
        payload.insert("cc".to_string(), json!(msg.cc));
    }
    if !msg.bcc.is_empty() {
        payload.insert("bcc".to_string(), json!(msg.bcc));
    }
    let reply = first_address_entry(&msg.reply_to);
    if !reply.email.is_empty() {
        payload.insert("reply_to".to_string(), json!(reply.email));
    }
    let encoded = load_all_attachments(msg)?;
    if !encoded.is_empty() {
        let attachments = encoded
            .iter()
            .map(|att| json!({"filename": att.filename, "content": att.base64_content()}))
            .collect();
        payload.insert("attachments".to_string(), Value::Array(attachments));
    }
    merge_additional(&mut payload, &msg.additional_data, true);
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_postmark(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut payload = Map::new();
    payload.insert("From".to_string(), json!(format_sender(msg)));
    payload.insert("To".to_string(), json!(msg.to.join(",")));
    payload.insert("Subject".to_string(), json!(msg.subject));
    if !msg.cc.is_empty() {
        payload.insert("Cc".to_string(), json!(msg.cc.join(",")));
    }
    if !msg.bcc.is_empty() {
        payload.insert("Bcc".to_string(), json!(msg.bcc.join(",")));
    }
    if !msg.text_body.is_empty() {
        payload.insert("TextBody".to_string(), json!(msg.text_body));
    }
    if !msg.html_body.is_empty() {
        payload.insert("HtmlBody".to_string(), json!(msg.html_body));
    }
    if msg.text_body.is_empty() && msg.html_body.is_empty() {
        payload.insert("TextBody".to_string(), json!(fallback_body(&msg.text_body)));
    }
    let reply = first_address_entry(&msg.reply_to);
    if !reply.email.is_empty() {
        payload.insert("ReplyTo".to_string(), json!(reply.email));
    }
    let encoded = load_all_attachments(msg)?;
    if !encoded.is_empty() {
        let attachments = encoded
            .iter()
            .map(|att| {
                let mut entry = Map::new();
                entry.insert("Name".to_string(), json!(att.filename));
                entry.insert("Content".to_string(), json!(att.base64_content()));
                entry.insert("ContentType".to_string(), json!(att.mime_type));
                if !att.content_id.is_empty() {
                    entry.insert("ContentID".to_string(), json!(att.content_id));
                }
                Value::Object(entry)
            })
            .collect();
        payload.insert("Attachments".to_string(), Value::Array(attachments));
    }
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_mailgun(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut form = Vec::new();
    form.push(("from".to_string(), format_sender(msg)));
    for to in &msg.to {
        form.push(("to".to_string(), to.clone()));
    }
    for cc in &msg.cc {
        form.push(("cc".to_string(), cc.clone()));
    }
    for bcc in &msg.bcc {
        form.push(("bcc".to_string(), bcc.clone()));
    }
    let reply = first_address_entry(&msg.reply_to);
    if !reply.email.is_empty() {
        form.push(("h:Reply-To".to_string(), reply.email));
    }
    form.push(("subject".to_string(), msg.subject.clone()));
    if !msg.text_body.is_empty() {
        form.push(("text".to_string(), msg.text_body.clone()));
    }
    if !msg.html_body.is_empty() {
        form.push(("html".to_string(), msg.html_body.clone()));
    }
    if msg.text_body.is_empty() && msg.html_body.is_empty() {
        form.push(("text".to_string(), fallback_body(&msg.text_body)));
    }
    Ok((
        PayloadBody::Form(form),
        "application/x-www-form-urlencoded",
    ))
}

fn build_brevo(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let sender = first_address_entry(&[format_sender(msg)]);
    let mut payload = Map::new();
    payload.insert("sender".to_string(), single_address_value(&sender));
    payload.insert(
        "to".to_string(),
        address_values(&parse_address_list(&msg.to)),
    );
    payload.insert("subject".to_string(), json!(msg.subject));
    if !msg.html_body.is_empty() {
        payload.insert("htmlContent".to_string(), json!(msg.html_body));
    }
    if !msg.text_body.is_empty() {
        payload.insert("textContent".to_string(), json!(msg.text_body));
    }
    if !msg.cc.is_empty() {
        payload.insert(
            "cc".to_string(),
            address_values(&parse_address_list(&msg.cc)),
        );
    }
    if !msg.bcc.is_empty() {
        payload.insert(
            "bcc".to_string(),
            address_values(&parse_address_list(&msg.bcc)),
        );
    }
    merge_additional(&mut payload, &msg.additional_data, true);
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_sparkpost(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let (from_name, from_email) = split_address(&format_sender(msg));
    let mut content = Map::new();
    content.insert(
        "from".to_string(),
        json!({"email": from_email, "name": from_name}),
    );
    content.insert("subject".to_string(), json!(msg.subject));
    if !msg.html_body.is_empty() {
        content.insert("html".to_string(), json!(msg.html_body));
    }
    if !msg.text_body.is_empty() {
        content.insert("text".to_string(), json!(msg.text_body));
    }
    let recipients = msg
        .to
        .iter()
        .map(|addr| json!({"address": {"email": addr.trim()}}))
        .collect();
    let payload = json!({
        "recipients": Value::Array(recipients),
        "content": Value::Object(content),
    });
    Ok((PayloadBody::Json(payload), "application/json"))
}

fn build_mailtrap(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let sender = first_address_entry(&[format_sender(msg)]);
    let mut payload = Map::new();
    payload.insert("from".to_string(), single_address_value(&sender));
    payload.insert(
        "to".to_string(),
        address_values(&parse_address_list(&msg.to)),
    );
    payload.insert("subject".to_string(), json!(msg.subject));
    if !msg.text_body.is_empty() {
        payload.insert("text".to_string(), json!(msg.text_body));
    }
    if !msg.html_body.is_empty() {
        payload.insert("html".to_string(), json!(msg.html_body));
    }
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

/// SES v2 outbound-emails call with the raw MIME message base64-embedded.
fn build_ses_raw(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let raw = build_mime_message(msg)?.formatted();

    let mut destination = Map::new();
    if !msg.to.is_empty() {
        destination.insert("ToAddresses".to_string(), json!(msg.to));
    }
    if !msg.cc.is_empty() {
        destination.insert("CcAddresses".to_string(), json!(msg.cc));
    }
    if !msg.bcc.is_empty() {
        destination.insert("BccAddresses".to_string(), json!(msg.bcc));
    }

    let mut payload = Map::new();
    payload.insert(
        "Content".to_string(),
        json!({"Raw": {"Data": BASE64_STANDARD.encode(&raw)}}),
    );
    if !destination.is_empty() {
        payload.insert("Destination".to_string(), Value::Object(destination));
    }
    if !msg.from.is_empty() {
        payload.insert("FromEmailAddress".to_string(), json!(msg.from));
    }
    if !msg.configuration_set.is_empty() {
        payload.insert("ConfigurationSetName".to_string(), json!(msg.configuration_set));
    }
    if !msg.tags.is_empty() {
        let tags = msg
            .tags
            .iter()
            .map(|(key, value)| json!({"Name": key, "Value": value}))
            .collect();
        payload.insert("EmailTags".to_string(), Value::Array(tags));
    }
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_generic_json(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut payload = Map::new();
    payload.insert("from".to_string(), json!(msg.from));
    payload.insert("to".to_string(), json!(msg.to));
    payload.insert("subject".to_string(), json!(msg.subject));
    if !msg.html_body.is_empty() {
        payload.insert("html".to_string(), json!(msg.html_body));
    }
    if !msg.text_body.is_empty() {
        payload.insert("text".to_string(), json!(msg.text_body));
    }
    if !msg.additional_data.is_empty() {
        payload.insert(
            "data".to_string(),
            Value::Object(msg.additional_data.clone()),
        );
    }
    Ok((PayloadBody::Json(Value::Object(payload)), "application/json"))
}

fn build_generic_form(msg: &Message) -> Result<(PayloadBody, &'static str), MailError> {
    let mut form = Vec::new();
    form.push(("from".to_string(), format_sender(msg)));
    form.push(("to".to_string(), msg.to.join(",")));
    form.push(("subject".to_string(), msg.subject.clone()));
    if !msg.text_body.is_empty() {
        form.push(("text".to_string(), msg.text_body.clone()));
    }
    if !msg.html_body.is_empty() {
        form.push(("html".to_string(), msg.html_body.clone()));
    }
    Ok((
        PayloadBody::Form(form),
        "application/x-www-form-urlencoded",
    ))
}

fn format_sender(msg: &Message) -> String {
    if msg.from_name.is_empty() {
        msg.from.clone()
    } else {
        format!("{} <{}>", msg.from_name, msg.from)
    }
}
