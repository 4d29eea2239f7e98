//! Reminder backends: where a scheduled item actually lands.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::SchedulingError;

/// Duration of an event in the calendar invite.
const EVENT_DURATION_HOURS: i64 = 3;

/// Duration of a follow-up slot.
const FOLLOW_UP_MINUTES: i64 = 30;

/// What to put on the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRequest {
    /// Identity key; backends may use it to make creation idempotent.
    pub key: String,
    pub kind: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    /// When the event itself happens, if it is an event.
    pub starts_at: Option<DateTime<Utc>>,
    pub remind_at: DateTime<Utc>,
}

/// External calendar/reminder collaborator.
#[async_trait]
pub trait ReminderBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Create the reminder and return a backend reference for it.
    async fn create(&self, request: &ReminderRequest) -> Result<String, SchedulingError>;
}

/// Writes one `.ics` calendar invite per identity key into a directory.
///
/// Re-creating the same key overwrites the same file, so a retried call
/// never leaves two invites behind.
pub struct IcsDirectoryBackend {
    dir: PathBuf,
}

impl IcsDirectoryBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.ics"))
    }
}

#[async_trait]
impl ReminderBackend for IcsDirectoryBackend {
    fn name(&self) -> &str {
        "ics-directory"
    }

    async fn create(&self, request: &ReminderRequest) -> Result<String, SchedulingError> {
        let backend_err = |e: std::io::Error| SchedulingError::Backend {
            backend: "ics-directory".into(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(backend_err)?;

        let path = self.path_for(&request.key);
        tokio::fs::write(&path, render_ics(request, Utc::now()))
            .await
            .map_err(backend_err)?;

        info!(key = %request.key, path = %path.display(), "Calendar invite written");
        Ok(path.display().to_string())
    }
}

fn ics_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Escape text values per RFC 5545.
fn ics_escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}

/// Render a single-event calendar with one display alarm.
pub fn render_ics(request: &ReminderRequest, stamp: DateTime<Utc>) -> String {
    let (start, end) = match request.starts_at {
        Some(start) => (start, start + Duration::hours(EVENT_DURATION_HOURS)),
        None => (
            request.remind_at,
            request.remind_at + Duration::minutes(FOLLOW_UP_MINUTES),
        ),
    };

    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//mail-maestro//reminders//EN".to_string(),
        "METHOD:PUBLISH".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}@mail-maestro", request.key),
        format!("DTSTAMP:{}", ics_time(stamp)),
        format!("DTSTART:{}", ics_time(start)),
        format!("DTEND:{}", ics_time(end)),
        format!("SUMMARY:{}", ics_escape(&request.title)),
    ];
    if let Some(location) = &request.location {
        lines.push(format!("LOCATION:{}", ics_escape(location)));
    }
    if let Some(description) = &request.description {
        lines.push(format!("DESCRIPTION:{}", ics_escape(description)));
    }
    if let Some(url) = &request.url {
        lines.push(format!("URL:{url}"));
    }
    lines.extend([
        "BEGIN:VALARM".to_string(),
        format!("TRIGGER;VALUE=DATE-TIME:{}", ics_time(request.remind_at)),
        "ACTION:DISPLAY".to_string(),
        format!("DESCRIPTION:{}", ics_escape(&request.title)),
        "END:VALARM".to_string(),
        "END:VEVENT".to_string(),
        "END:VCALENDAR".to_string(),
    ]);

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}
