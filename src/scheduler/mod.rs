//! Scheduler: idempotent sink for reminders and calendar entries.
//!
//! Every validated item maps to an identity key derived from its normalized
//! content. A key is scheduled at most once: the check, the backend call and
//! the record insert run under a per-key lock, and the insert itself is an
//! `ON CONFLICT DO NOTHING` so concurrent processes cannot double-record.
//! Only the backend call is bounded by a timeout; cancelling a caller never
//! splits a created reminder from its record.

pub mod backend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::TriageConfig;
use crate::context::EmailContext;
use crate::error::SchedulingError;
use crate::pipeline::types::{ValidatedItem, ValidatedPayload};
use crate::store::Database;

pub use backend::{IcsDirectoryBackend, ReminderBackend, ReminderRequest};

/// Hex sha256 of `input`.
pub fn digest(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Lowercase, keep letters and digits, collapse whitespace.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identity key for an item, from its normalized content only.
///
/// Email metadata is deliberately absent: the same event announced in two
/// emails gets one key.
pub fn identity_key(payload: &ValidatedPayload) -> String {
    let canonical = match payload {
        ValidatedPayload::Event {
            name,
            starts_at,
            venue,
            ..
        } => format!(
            "event|{}|{}|{}",
            normalize(name),
            starts_at.with_timezone(&Utc).format("%Y-%m-%dT%H:%M"),
            normalize(venue.as_deref().unwrap_or_default()),
        ),
        ValidatedPayload::Recruiter { company, role, .. } => {
            format!("recruiter|{}|{}", normalize(company), normalize(role))
        }
    };
    digest(&canonical)
}

/// Persisted effect of scheduling one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub key: String,
    pub kind: String,
    pub title: String,
    pub remind_at: DateTime<Utc>,
    pub event_at: Option<DateTime<Utc>>,
    pub backend_ref: String,
    /// Email that first caused this record; informational only.
    pub source_email_id: String,
    pub created_at: DateTime<Utc>,
}

type KeyLocks = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Idempotent scheduler over a reminder backend and the record store.
pub struct Scheduler {
    db: Arc<dyn Database>,
    backend: Arc<dyn ReminderBackend>,
    reminder_lead: chrono::Duration,
    follow_up: chrono::Duration,
    /// Bound on a single backend call.
    create_timeout: Duration,
    locks: KeyLocks,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        backend: Arc<dyn ReminderBackend>,
        config: &TriageConfig,
    ) -> Self {
        Self {
            db,
            backend,
            reminder_lead: chrono::Duration::from_std(config.reminder_lead)
                .unwrap_or(chrono::Duration::hours(24)),
            follow_up: chrono::Duration::from_std(config.recruiter_follow_up)
                .unwrap_or(chrono::Duration::hours(48)),
            create_timeout: config.tool_timeout,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Look up a record by identity key.
    pub async fn get(&self, key: &str) -> Result<Option<ScheduleRecord>, SchedulingError> {
        lookup(self.db.as_ref(), key).await
    }

    /// Schedule an item, or return the existing record for its key.
    ///
    /// On backend failure nothing is recorded and the call may be retried.
    /// The check, the backend call and the insert run on a detached task, so
    /// a caller that gives up (a timeout around this future) never leaves a
    /// created reminder unrecorded: the task finishes the insert and a retry
    /// finds the record.
    pub async fn schedule(
        &self,
        context: &EmailContext,
        item: &ValidatedItem,
    ) -> Result<ScheduleRecord, SchedulingError> {
        let key = identity_key(&item.payload);
        let job = ScheduleJob {
            db: Arc::clone(&self.db),
            backend: Arc::clone(&self.backend),
            locks: Arc::clone(&self.locks),
            create_timeout: self.create_timeout,
            request: self.reminder_request(&key, context, &item.payload),
            email_id: context.id().to_string(),
            key,
        };

        tokio::spawn(job.run())
            .await
            .map_err(|e| SchedulingError::Store(format!("scheduling task failed: {e}")))?
    }

    fn reminder_request(
        &self,
        key: &str,
        context: &EmailContext,
        payload: &ValidatedPayload,
    ) -> ReminderRequest {
        let now = context.now().with_timezone(&Utc);
        match payload {
            ValidatedPayload::Event {
                name,
                starts_at,
                venue,
                ticket_link,
                presale_info,
                notes,
            } => {
                let starts_at = starts_at.with_timezone(&Utc);
                let description = [presale_info.as_deref(), notes.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("\n");
                ReminderRequest {
                    key: key.to_string(),
                    kind: "event".into(),
                    title: name.clone(),
                    description: (!description.is_empty()).then_some(description),
                    location: venue.clone(),
                    url: ticket_link.clone(),
                    starts_at: Some(starts_at),
                    remind_at: (starts_at - self.reminder_lead).max(now),
                }
            }
            ValidatedPayload::Recruiter {
                company,
                role,
                contact,
            } => ReminderRequest {
                key: key.to_string(),
                kind: "recruiter".into(),
                title: format!("Follow up: {role} at {company}"),
                description: contact.as_ref().map(|c| format!("Recruiter: {c}")),
                location: None,
                url: None,
                starts_at: None,
                remind_at: now + self.follow_up,
            },
        }
    }
}

async fn lookup(db: &dyn Database, key: &str) -> Result<Option<ScheduleRecord>, SchedulingError> {
    db.get_schedule_record(key)
        .await
        .map_err(|e| SchedulingError::Store(e.to_string()))
}

/// One scheduling attempt, owned so it can outlive its caller.
struct ScheduleJob {
    db: Arc<dyn Database>,
    backend: Arc<dyn ReminderBackend>,
    locks: KeyLocks,
    create_timeout: Duration,
    key: String,
    request: ReminderRequest,
    email_id: String,
}

impl ScheduleJob {
    async fn run(self) -> Result<ScheduleRecord, SchedulingError> {
        let lease = KeyLease::acquire(&self.locks, &self.key);
        let _guard = lease.lock.lock().await;

        let key = self.key.as_str();
        if let Some(existing) = lookup(self.db.as_ref(), key).await? {
            debug!(key, email_id = %self.email_id, "Item already scheduled, no-op");
            return Ok(existing);
        }

        let backend_ref =
            match tokio::time::timeout(self.create_timeout, self.backend.create(&self.request))
                .await
            {
                Ok(Ok(backend_ref)) => backend_ref,
                Ok(Err(e)) => {
                    error!(
                        key,
                        backend = self.backend.name(),
                        error = %e,
                        "Reminder backend failed"
                    );
                    return Err(e);
                }
                Err(_) => {
                    error!(key, backend = self.backend.name(), "Reminder backend timed out");
                    return Err(SchedulingError::Timeout(self.create_timeout));
                }
            };

        let record = ScheduleRecord {
            key: key.to_string(),
            kind: self.request.kind.clone(),
            title: self.request.title.clone(),
            remind_at: self.request.remind_at,
            event_at: self.request.starts_at,
            backend_ref,
            source_email_id: self.email_id.clone(),
            created_at: Utc::now(),
        };

        let inserted = self
            .db
            .insert_schedule_record(&record)
            .await
            .map_err(|e| SchedulingError::Store(e.to_string()))?;

        if inserted {
            info!(
                key,
                email_id = %self.email_id,
                kind = %record.kind,
                remind_at = %record.remind_at,
                "Item scheduled"
            );
            return Ok(record);
        }

        // Another process recorded the key between our check and insert.
        lookup(self.db.as_ref(), key)
            .await?
            .ok_or_else(|| SchedulingError::Store(format!("record {key} vanished after conflict")))
    }
}

/// Holds a key's lock entry; removes it on drop once nobody else does.
struct KeyLease {
    locks: KeyLocks,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl KeyLease {
    fn acquire(locks: &KeyLocks, key: &str) -> Self {
        let lock = {
            let mut map = locks.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Self {
            locks: Arc::clone(locks),
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}
