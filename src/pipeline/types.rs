//! Item types shared by extractors, validators, the gateway and pipelines.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::scheduler::{ScheduleRecord, digest};

/// Per-item state machine: `Start → Extracted → {Validated → Scheduled | Rejected}`.
///
/// `Failed` is reached when scheduling exhausts its retries; the identity key
/// stays unrecorded so a later run can still schedule the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Start,
    Extracted,
    Validated,
    Scheduled,
    Rejected,
    Failed,
}

impl ItemState {
    pub fn can_transition_to(&self, target: ItemState) -> bool {
        use ItemState::*;

        matches!(
            (self, target),
            (Start, Extracted)
                | (Extracted, Validated)
                | (Extracted, Rejected)
                | (Extracted, Failed)
                | (Validated, Scheduled)
                | (Validated, Rejected)
                | (Validated, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Rejected | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Extracted => "extracted",
            Self::Validated => "validated",
            Self::Scheduled => "scheduled",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "extracted" => Ok(Self::Extracted),
            "validated" => Ok(Self::Validated),
            "scheduled" => Ok(Self::Scheduled),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown item state: '{other}'")),
        }
    }
}

/// Event fields as pulled from an email, before any checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub date_time: Option<String>,
    #[serde(default)]
    pub venue_address: Option<String>,
    #[serde(default)]
    pub presale_info: Option<String>,
    #[serde(default)]
    pub ticket_link: Option<String>,
    #[serde(default)]
    pub additional_notes: Option<String>,
}

/// Recruiter fields as pulled from an email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecruiterDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    Event(EventDetails),
    Recruiter(RecruiterDetails),
}

impl ItemPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Recruiter(_) => "recruiter",
        }
    }
}

/// One unit of structured data produced by `extract`.
///
/// The id is derived from the payload, so the same content extracted on a
/// retried run gets the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub payload: ItemPayload,
}

impl RawItem {
    pub fn new(payload: ItemPayload) -> Self {
        let canonical = serde_json::to_string(&payload).unwrap_or_default();
        let id = format!("item-{}", &digest(&canonical)[..16]);
        Self { id, payload }
    }
}

/// Checked, normalized item content ready for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatedPayload {
    Event {
        name: String,
        starts_at: DateTime<FixedOffset>,
        venue: Option<String>,
        ticket_link: Option<String>,
        presale_info: Option<String>,
        notes: Option<String>,
    },
    Recruiter {
        company: String,
        role: String,
        contact: Option<String>,
    },
}

/// Output of a passing `validate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedItem {
    /// Id of the `RawItem` this was validated from.
    pub item_id: String,
    pub payload: ValidatedPayload,
}

/// Why an item did not reach scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("missing name")]
    MissingName,
    #[error("missing date")]
    MissingDate,
    #[error("unparseable date: {0}")]
    UnparseableDate(String),
    #[error("event is in the past")]
    EventInPast,
    #[error("missing company")]
    MissingCompany,
    #[error("missing role")]
    MissingRole,
    #[error("wrong item kind: {0}")]
    WrongKind(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result of a `validate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Validation {
    Valid(ValidatedItem),
    Rejected { reason: RejectionReason },
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub state: ItemState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ScheduleRecord>,
}

impl ItemOutcome {
    pub fn scheduled(item_id: &str, record: ScheduleRecord) -> Self {
        Self {
            item_id: item_id.to_string(),
            state: ItemState::Scheduled,
            reason: None,
            record: Some(record),
        }
    }

    pub fn rejected(item_id: &str, reason: &RejectionReason) -> Self {
        Self {
            item_id: item_id.to_string(),
            state: ItemState::Rejected,
            reason: Some(reason.to_string()),
            record: None,
        }
    }

    pub fn failed(item_id: &str, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            state: ItemState::Failed,
            reason: Some(reason.into()),
            record: None,
        }
    }
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline: String,
    pub items: Vec<ItemOutcome>,
    /// Set when the run was aborted by a scope violation or extraction failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}
