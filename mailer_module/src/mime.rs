//! RFC 5322 message assembly on top of lettre's builder: alternative
//! text/html bodies, related parts for inline attachments, a mixed envelope
//! for regular ones, plus the custom header surface (List-Unsubscribe, SES
//! configuration set and tags, caller-supplied headers).

use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MimePart, Body, Mailbox, MultiPart, SinglePart};
use lettre::Address;

use crate::attachments::{load_all_attachments, partition_attachments, LoadedAttachment};
use crate::error::MailError;
use crate::message::Message;

enum BodySection {
    Single(SinglePart),
    Multi(MultiPart),
}

/// Build the full MIME message for SMTP delivery or raw-payload providers.
pub fn build_mime_message(msg: &Message) -> Result<lettre::Message, MailError> {
    let attachments = load_all_attachments(msg)?;
    let (inline, regular) = partition_attachments(&attachments);

    let mut builder = lettre::Message::builder()
        .from(sender_mailbox(msg)?)
        .subject(msg.subject.clone());
    for to in &msg.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in &msg.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }
    for bcc in &msg.bcc {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }
    for reply_to in &msg.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }

    for (key, value) in &msg.headers {
        if key.eq_ignore_ascii_case("content-type") {
            continue;
        }
        builder = builder.raw_header(HeaderValue::new(header_name(key)?, value.clone()));
    }
    if !msg.list_unsubscribe.is_empty() {
        builder = builder.raw_header(HeaderValue::new(
            HeaderName::new_from_ascii_str("List-Unsubscribe"),
            msg.list_unsubscribe.join(", "),
        ));
        if msg.list_unsubscribe_post {
            builder = builder.raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("List-Unsubscribe-Post"),
                "List-Unsubscribe=One-Click".to_string(),
            ));
        }
    }
    if !msg.configuration_set.is_empty() {
        builder = builder.raw_header(HeaderValue::new(
            HeaderName::new_from_ascii_str("X-SES-CONFIGURATION-SET"),
            msg.configuration_set.clone(),
        ));
    }
    if !msg.tags.is_empty() {
        let joined = msg
            .tags
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";");
        builder = builder.raw_header(HeaderValue::new(
            HeaderName::new_from_ascii_str("X-SES-MESSAGE-TAGS"),
            joined,
        ));
    }

    let body = body_section(msg, &inline)?;
    let message = if regular.is_empty() {
        match body {
            BodySection::Single(part) => builder.singlepart(part)?,
            BodySection::Multi(part) => builder.multipart(part)?,
        }
    } else {
        let mut mixed = match body {
            BodySection::Single(part) => MultiPart::mixed().singlepart(part),
            BodySection::Multi(part) => MultiPart::mixed().multipart(part),
        };
        for att in &regular {
            mixed = mixed.singlepart(attachment_part(att)?);
        }
        builder.multipart(mixed)?
    };
    Ok(message)
}

fn body_section(msg: &Message, inline: &[LoadedAttachment]) -> Result<BodySection, MailError> {
    let has_inline = !inline.is_empty() && !msg.html_body.is_empty();

    if has_inline {
        let mut related = MultiPart::related().singlepart(SinglePart::html(msg.html_body.clone()));
        for att in inline {
            related = related.singlepart(attachment_part(att)?);
        }
        if !msg.text_body.is_empty() {
            let alternative = MultiPart::alternative()
                .singlepart(SinglePart::plain(msg.text_body.clone()))
                .multipart(related);
            return Ok(BodySection::Multi(alternative));
        }
        return Ok(BodySection::Multi(related));
    }

    if !msg.html_body.is_empty() && !msg.text_body.is_empty() {
        return Ok(BodySection::Multi(MultiPart::alternative_plain_html(
            msg.text_body.clone(),
            msg.html_body.clone(),
        )));
    }

    if !msg.html_body.is_empty() {
        Ok(BodySection::Single(SinglePart::html(msg.html_body.clone())))
    } else {
        Ok(BodySection::Single(SinglePart::plain(msg.text_body.clone())))
    }
}

fn attachment_part(att: &LoadedAttachment) -> Result<SinglePart, MailError> {
    let content_type = ContentType::parse(&att.mime_type)
        .map_err(|err| MailError::Attachment(format!("content type {}: {err}", att.mime_type)))?;
    let part = if att.inline {
        let cid = if att.content_id.is_empty() {
            att.filename.clone()
        } else {
            att.content_id.clone()
        };
        MimePart::new_inline(cid).body(Body::new(att.data.clone()), content_type)
    } else {
        MimePart::new(att.filename.clone()).body(Body::new(att.data.clone()), content_type)
    };
    Ok(part)
}

fn sender_mailbox(msg: &Message) -> Result<Mailbox, MailError> {
    let address = msg.from.parse::<Address>()?;
    let name = if msg.from_name.is_empty() {
        None
    } else {
        Some(msg.from_name.clone())
    };
    Ok(Mailbox::new(name, address))
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, MailError> {
    Ok(raw.trim().parse::<Mailbox>()?)
}

fn header_name(key: &str) -> Result<HeaderName, MailError> {
    HeaderName::new_from_ascii(key.to_string())
        .map_err(|err| MailError::Payload(format!("invalid header {key}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Attachment;

    fn base_message() -> Message {
        Message {
            from: "noreply@acme.example".to_string(),
            from_name: "Acme".to_string(),
            to: vec!["User <user@example.com>".to_string()],
            subject: "Greetings".to_string(),
            text_body: "plain".to_string(),
            html_body: "<p>rich</p>".to_string(),
            ..Message::default()
        }
    }

    #[test]
    fn builds_alternative_message() {
        let message = build_mime_message(&base_message()).expect("build");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("Subject: Greetings"));
        assert!(rendered.contains("plain"));
        assert!(rendered.contains("<p>rich</p>"));
    }

    #[test]
    fn custom_headers_and_tags_are_emitted() {
        let mut msg = base_message();
        msg.headers
            .insert("X-Campaign".to_string(), "launch".to_string());
        msg.tags.insert("team".to_string(), "growth".to_string());
        msg.tags.insert("app".to_string(), "store".to_string());
        msg.configuration_set = "prod".to_string();
        let rendered =
            String::from_utf8(build_mime_message(&msg).expect("build").formatted()).expect("utf8");
        assert!(rendered.contains("X-Campaign: launch"));
        assert!(rendered.contains("X-SES-CONFIGURATION-SET: prod"));
        // BTreeMap ordering keeps the tag header deterministic.
        assert!(rendered.contains("X-SES-MESSAGE-TAGS: app=store;team=growth"));
    }

    #[test]
    fn regular_attachment_switches_to_mixed() {
        let mut msg = base_message();
        msg.attachments.push(Attachment {
            source: "data:text/plain;base64,aGVsbG8=".to_string(),
            name: "hello.txt".to_string(),
            ..Attachment::default()
        });
        let rendered =
            String::from_utf8(build_mime_message(&msg).expect("build").formatted()).expect("utf8");
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("hello.txt"));
    }
}
