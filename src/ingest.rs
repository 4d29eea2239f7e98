//! Ingest: turn a raw RFC 822 message into an `EmailContext`.
//!
//! Body normalization happens here, before the context is frozen. After
//! this point the body is never rewritten; tools that want a different view
//! derive one.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, FixedOffset};
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;

use crate::context::{EmailContext, RawEmailContext};
use crate::error::ContextError;
use crate::scheduler::digest;

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br\s*/?|/p|/div|/li|/tr|/h[1-6])\s*>").expect("valid regex")
});

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("valid regex"));

static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Strip HTML tags, turning block-level closers into line breaks.
pub fn strip_html(html: &str) -> String {
    let with_breaks = BLOCK_TAG.replace_all(html, "\n");
    let mut result = String::with_capacity(with_breaks.len());
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    decode_entities(&result)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Normalize body text: drop control characters, collapse horizontal
/// whitespace, trim lines, and keep at most one blank line between blocks.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .replace("\r\n", "\n")
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();

    let lines: Vec<String> = cleaned
        .lines()
        .map(|line| HORIZONTAL_WS.replace_all(line, " ").trim().to_string())
        .collect();

    BLANK_RUN
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Build an `EmailContext` from a raw RFC 822 message.
///
/// `now` and `deployment_env` are supplied by the caller so that ingest is
/// deterministic.
pub fn context_from_rfc822(
    raw: &[u8],
    now: DateTime<FixedOffset>,
    deployment_env: &str,
) -> Result<EmailContext, ContextError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(ContextError::Malformed {
            field: "body",
            reason: "not a parseable RFC 822 message".into(),
        })?;

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", &digest(&String::from_utf8_lossy(raw))[..16]));

    let thread_id = first_header_text(parsed.references())
        .or_else(|| first_header_text(parsed.in_reply_to()))
        .unwrap_or_else(|| id.clone());

    let subject = normalize_text(parsed.subject().unwrap_or_default());
    let body = normalize_text(&extract_text(&parsed));

    let raw_context = RawEmailContext {
        id: Some(id),
        sender: Some(extract_sender(&parsed)),
        subject: Some(subject),
        body: Some(body),
        thread_id: Some(thread_id),
        image_data_urls: Some(extract_image_data_urls(&parsed)),
        current_time: Some(now.to_rfc3339()),
        deployment_env: Some(deployment_env.to_string()),
    };

    EmailContext::try_from(raw_context)
}

fn first_header_text(value: &mail_parser::HeaderValue) -> Option<String> {
    if let Some(text) = value.as_text() {
        return Some(text.to_string());
    }
    value
        .as_text_list()
        .and_then(|list| list.first())
        .map(|s| s.to_string())
}

/// `Name <address>` when a display name is present, otherwise the address.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    let address = addr.address().unwrap_or_default();
    match addr.name() {
        Some(name) if !name.is_empty() => format!("{name} <{address}>"),
        _ => address.to_string(),
    }
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

fn extract_image_data_urls(parsed: &mail_parser::Message) -> Vec<String> {
    parsed
        .attachments()
        .filter_map(|part| {
            let ct = MimeHeaders::content_type(part)?;
            if !ct.ctype().eq_ignore_ascii_case("image") {
                return None;
            }
            let subtype = ct.subtype().unwrap_or("octet-stream");
            Some(format!(
                "data:image/{subtype};base64,{}",
                BASE64.encode(part.contents())
            ))
        })
        .collect()
}
