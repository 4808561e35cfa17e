//! `{{placeholder}}` substitution over subject and body fields, fed from
//! message fields and the flattened `additional_data` map.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::message::Message;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("regex"))
}

/// Collapse a raw key into the `[a-z0-9._]` space placeholders use:
/// lowercased, runs of punctuation folded to single separators, leading and
/// trailing separators stripped.
pub fn normalize_placeholder_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(key.len());
    let mut last = '\0';
    for ch in key.chars() {
        match ch {
            'a'..='z' | '0'..='9' => {
                out.push(ch);
                last = ch;
            }
            '.' | '_' => {
                if last == '.' || last == '_' || out.is_empty() {
                    continue;
                }
                out.push(ch);
                last = ch;
            }
            _ => {
                if last == '_' || out.is_empty() {
                    continue;
                }
                out.push('_');
                last = '_';
            }
        }
    }
    out.trim_matches(['.', '_']).to_string()
}

fn register_value(values: &mut HashMap<String, String>, value: &str, overwrite: bool, keys: &[&str]) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    for key in keys {
        let normalized = normalize_placeholder_key(key);
        if normalized.is_empty() {
            continue;
        }
        if !overwrite && values.contains_key(&normalized) {
            continue;
        }
        values.insert(normalized, value.to_string());
    }
}

fn register_slice(values: &mut HashMap<String, String>, source: &[String], keys: &[&str]) {
    let clean: Vec<&str> = source
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect();
    if clean.is_empty() {
        return;
    }
    register_value(values, &clean.join(","), false, keys);
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => None,
    }
}

fn flatten_additional_data(values: &mut HashMap<String, String>, prefix: &str, data: &Map<String, Value>) {
    for (key, value) in data {
        let next = normalize_placeholder_key(key);
        if next.is_empty() {
            continue;
        }
        let full_key = if prefix.is_empty() {
            next
        } else {
            format!("{prefix}.{next}")
        };
        match value {
            Value::Object(inner) => flatten_additional_data(values, &full_key, inner),
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .filter_map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                register_additional(values, &full_key, &joined);
            }
            other => {
                if let Some(text) = scalar_to_string(other) {
                    register_additional(values, &full_key, &text);
                }
            }
        }
    }
}

fn register_additional(values: &mut HashMap<String, String>, key: &str, value: &str) {
    if key.is_empty() {
        return;
    }
    register_value(values, value, false, &[key]);
    let data_key = format!("data.{key}");
    register_value(values, value, true, &[data_key.as_str()]);
}

/// Build the substitution table for a message: well-known fields first, then
/// the flattened additional-data map (which never shadows a field key but
/// always owns its `data.`-prefixed alias).
pub fn build_placeholder_values(msg: &Message) -> HashMap<String, String> {
    let mut values = HashMap::new();
    register_value(&mut values, &msg.from, false, &["from", "sender", "from_email"]);
    register_value(&mut values, &msg.from_name, false, &["from_name", "sender_name"]);
    register_slice(&mut values, &msg.to, &["to", "recipient", "recipients"]);
    register_slice(&mut values, &msg.cc, &["cc"]);
    register_slice(&mut values, &msg.bcc, &["bcc"]);
    register_slice(&mut values, &msg.reply_to, &["reply_to"]);
    register_value(&mut values, &msg.subject, false, &["subject"]);
    register_value(&mut values, &msg.provider, false, &["provider"]);
    register_value(&mut values, &msg.host, false, &["host"]);
    flatten_additional_data(&mut values, "", &msg.additional_data);
    values
}

fn substitute(input: &str, values: &HashMap<String, String>) -> String {
    placeholder_re()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let key = normalize_placeholder_key(&caps[1]);
            match values.get(&key) {
                Some(value) => value.clone(),
                // Unknown placeholders pass through untouched.
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn substitute_value(value: &mut Value, values: &HashMap<String, String>) {
    match value {
        Value::String(s) => *s = substitute(s, values),
        Value::Array(items) => {
            for item in items {
                substitute_value(item, values);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, values);
            }
        }
        _ => {}
    }
}

/// Resolve placeholders across subject, bodies and any explicit HTTP
/// payload.
pub fn apply_placeholders(msg: &mut Message) {
    let values = build_placeholder_values(msg);
    msg.subject = substitute(&msg.subject, &values);
    msg.body = substitute(&msg.body, &values);
    msg.text_body = substitute(&msg.text_body, &values);
    msg.html_body = substitute(&msg.html_body, &values);
    if let Some(payload) = msg.http_payload.as_mut() {
        for (_, item) in payload.iter_mut() {
            substitute_value(item, &values);
        }
    }
}
