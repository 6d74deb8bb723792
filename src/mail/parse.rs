//! RFC 822 decoding via mail-parser.
//!
//! Plain and HTML bodies are collected separately from every body part the
//! parser found, nested multiparts included. When a message has no plain
//! part, the plain body is derived from the HTML.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};

use super::model::AttachmentMeta;
use crate::error::MailboxError;

/// Headers and bodies of one decoded message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub header_message_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentMeta>,
}

/// Decode a raw message. `id` only labels the error.
pub fn parse_raw(id: &str, raw: &[u8]) -> Result<ParsedMessage, MailboxError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(MailboxError::Decode {
            id: id.to_string(),
            reason: "empty message".into(),
        });
    }
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailboxError::Decode {
            id: id.to_string(),
            reason: "not an RFC 822 message".into(),
        })?;

    let mut text_parts = Vec::new();
    for part_id in &parsed.text_body {
        if let Some(part) = parsed.parts.get(*part_id as usize) {
            match &part.body {
                PartType::Text(t) => text_parts.push(t.to_string()),
                PartType::Html(h) => text_parts.push(strip_html(h)),
                _ => {}
            }
        }
    }

    let mut html_parts = Vec::new();
    for part_id in &parsed.html_body {
        if let Some(part) = parsed.parts.get(*part_id as usize)
            && let PartType::Html(h) = &part.body
        {
            html_parts.push(h.to_string());
        }
    }

    let attachments = parsed
        .attachments()
        .map(|part| AttachmentMeta {
            filename: part.attachment_name().unwrap_or("adjunto").to_string(),
            mime_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: part.contents().len(),
        })
        .collect();

    Ok(ParsedMessage {
        header_message_id: parsed.message_id().map(|s| s.to_string()),
        from: extract_sender(parsed.from()),
        to: extract_addresses(parsed.to()),
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        text: text_parts.join("\n").trim().to_string(),
        html: if html_parts.is_empty() {
            None
        } else {
            Some(html_parts.join("\n"))
        },
        date: parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
        attachments,
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First address of the From header, or empty.
fn extract_sender(addr: Option<&mail_parser::Address>) -> String {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// All addresses of an address header, flattening groups.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}
