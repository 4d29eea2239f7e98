//! Email context: the immutable record of one inbound message.
//!
//! An `EmailContext` can only be built through validation of a
//! `RawEmailContext`, and exposes no setters. Every tool call that carries
//! context fields is checked against the original with
//! [`EmailContext::verify_unchanged`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Names of the immutable fields, in wire order.
pub const CONTEXT_FIELDS: [&str; 8] = [
    "id",
    "sender",
    "subject",
    "body",
    "thread_id",
    "image_data_urls",
    "current_time",
    "deployment_env",
];

/// Unvalidated context as it arrives on the wire or inside a tool call.
///
/// Every field is optional so that absence can be reported precisely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEmailContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Treated as empty when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_env: Option<String>,
}

/// Immutable context of one inbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEmailContext")]
pub struct EmailContext {
    id: String,
    sender: String,
    subject: String,
    body: String,
    thread_id: String,
    image_data_urls: Vec<String>,
    current_time: String,
    deployment_env: String,
    #[serde(skip)]
    received_at: Option<DateTime<FixedOffset>>,
}

impl TryFrom<RawEmailContext> for EmailContext {
    type Error = ContextError;

    fn try_from(raw: RawEmailContext) -> Result<Self, Self::Error> {
        let id = raw.id.ok_or(ContextError::MissingField("id"))?;
        if id.trim().is_empty() {
            return Err(ContextError::Malformed {
                field: "id",
                reason: "must not be blank".into(),
            });
        }
        let sender = raw.sender.ok_or(ContextError::MissingField("sender"))?;
        let subject = raw.subject.ok_or(ContextError::MissingField("subject"))?;
        let body = raw.body.ok_or(ContextError::MissingField("body"))?;
        let thread_id = raw.thread_id.ok_or(ContextError::MissingField("thread_id"))?;
        if thread_id.trim().is_empty() {
            return Err(ContextError::Malformed {
                field: "thread_id",
                reason: "must not be blank".into(),
            });
        }
        let current_time = raw
            .current_time
            .ok_or(ContextError::MissingField("current_time"))?;
        let received_at =
            DateTime::parse_from_rfc3339(&current_time).map_err(|e| ContextError::Malformed {
                field: "current_time",
                reason: format!("not an RFC 3339 timestamp: {e}"),
            })?;
        let deployment_env = raw
            .deployment_env
            .ok_or(ContextError::MissingField("deployment_env"))?;
        let image_data_urls = raw.image_data_urls.unwrap_or_default();
        for (index, url) in image_data_urls.iter().enumerate() {
            check_image_data_url(url).map_err(|reason| ContextError::Malformed {
                field: "image_data_urls",
                reason: format!("entry {index}: {reason}"),
            })?;
        }

        Ok(Self {
            id,
            sender,
            subject,
            body,
            thread_id,
            image_data_urls,
            current_time,
            deployment_env,
            received_at: Some(received_at),
        })
    }
}

/// `data:image/<subtype>;base64,<payload>` with a decodable payload.
fn check_image_data_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("data:image/")
        .ok_or_else(|| "not a data:image/ URL".to_string())?;
    let (_, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| "missing ;base64, marker".to_string())?;
    BASE64
        .decode(payload.trim())
        .map(|_| ())
        .map_err(|e| format!("invalid base64 payload: {e}"))
}

impl EmailContext {
    /// Parse and validate a context from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ContextError> {
        let raw: RawEmailContext =
            serde_json::from_value(value).map_err(|e| ContextError::Json(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Parse and validate a context from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        let raw: RawEmailContext =
            serde_json::from_str(json).map_err(|e| ContextError::Json(e.to_string()))?;
        Self::try_from(raw)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn image_data_urls(&self) -> &[String] {
        &self.image_data_urls
    }

    pub fn current_time(&self) -> &str {
        &self.current_time
    }

    pub fn deployment_env(&self) -> &str {
        &self.deployment_env
    }

    /// Parsed `current_time`. Derived once at construction.
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.received_at.unwrap_or_else(|| {
            DateTime::parse_from_rfc3339(&self.current_time)
                .unwrap_or_else(|_| DateTime::<chrono::Utc>::MIN_UTC.fixed_offset())
        })
    }

    /// Envelope form of this context, as carried inside tool calls.
    pub fn to_envelope(&self) -> RawEmailContext {
        RawEmailContext {
            id: Some(self.id.clone()),
            sender: Some(self.sender.clone()),
            subject: Some(self.subject.clone()),
            body: Some(self.body.clone()),
            thread_id: Some(self.thread_id.clone()),
            image_data_urls: Some(self.image_data_urls.clone()),
            current_time: Some(self.current_time.clone()),
            deployment_env: Some(self.deployment_env.clone()),
        }
    }

    /// Check that a presented envelope carries exactly this context.
    ///
    /// Returns the name of the first field that is absent or differs.
    /// Comparison is byte-exact; no trimming or normalization.
    pub fn verify_unchanged(&self, presented: &RawEmailContext) -> Result<(), &'static str> {
        fn same(original: &str, presented: Option<&String>) -> bool {
            presented.is_some_and(|p| p.as_bytes() == original.as_bytes())
        }

        if !same(&self.id, presented.id.as_ref()) {
            return Err("id");
        }
        if !same(&self.sender, presented.sender.as_ref()) {
            return Err("sender");
        }
        if !same(&self.subject, presented.subject.as_ref()) {
            return Err("subject");
        }
        if !same(&self.body, presented.body.as_ref()) {
            return Err("body");
        }
        if !same(&self.thread_id, presented.thread_id.as_ref()) {
            return Err("thread_id");
        }
        let urls = presented.image_data_urls.as_deref().unwrap_or(&[]);
        if urls != self.image_data_urls.as_slice() {
            return Err("image_data_urls");
        }
        if !same(&self.current_time, presented.current_time.as_ref()) {
            return Err("current_time");
        }
        if !same(&self.deployment_env, presented.deployment_env.as_ref()) {
            return Err("deployment_env");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A complete raw context with sensible values.
    pub fn raw_context(id: &str, subject: &str, body: &str) -> RawEmailContext {
        RawEmailContext {
            id: Some(id.into()),
            sender: Some("Alice <alice@example.com>".into()),
            subject: Some(subject.into()),
            body: Some(body.into()),
            thread_id: Some(format!("thread-{id}")),
            image_data_urls: Some(vec![]),
            current_time: Some("2026-06-01T09:00:00+02:00".into()),
            deployment_env: Some("test".into()),
        }
    }

    pub fn context(id: &str, subject: &str, body: &str) -> EmailContext {
        EmailContext::try_from(raw_context(id, subject, body)).unwrap()
    }
}
