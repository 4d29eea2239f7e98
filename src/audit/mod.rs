//! Audit trail: append-only record of classification and dispatch decisions.
//!
//! One entry per classification, one per item terminal state, one per direct
//! handling and one per aborted pipeline run. Each entry carries a dedup key;
//! re-appending the same decision (a retried email) is a silent no-op.
//! New entries are fanned out on a broadcast channel for observers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::classifier::{Route, RouteDecision};
use crate::context::EmailContext;
use crate::error::DatabaseError;
use crate::pipeline::types::{ItemOutcome, ItemState};
use crate::store::Database;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Classification,
    ItemTerminal,
    DirectHandled,
    PipelineAborted,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::ItemTerminal => "item_terminal",
            Self::DirectHandled => "direct_handled",
            Self::PipelineAborted => "pipeline_aborted",
        }
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Self::Classification),
            "item_terminal" => Ok(Self::ItemTerminal),
            "direct_handled" => Ok(Self::DirectHandled),
            "pipeline_aborted" => Ok(Self::PipelineAborted),
            other => Err(format!("unknown audit kind: '{other}'")),
        }
    }
}

/// A single audit record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub email_id: String,
    pub kind: AuditKind,
    pub route: Route,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ItemState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    fn new(email_id: &str, kind: AuditKind, route: Route) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_id: email_id.to_string(),
            kind,
            route,
            confidence: None,
            rationale: None,
            pipeline: None,
            item_id: None,
            identity_key: None,
            state: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    /// Uniqueness key: at most one entry per decision.
    pub fn dedup_key(&self) -> String {
        match self.kind {
            AuditKind::Classification | AuditKind::DirectHandled => {
                format!("{}|{}", self.email_id, self.kind.as_str())
            }
            AuditKind::ItemTerminal => format!(
                "{}|{}|{}|{}|{}",
                self.email_id,
                self.kind.as_str(),
                self.pipeline.as_deref().unwrap_or_default(),
                self.item_id.as_deref().unwrap_or_default(),
                self.state.map(|s| s.as_str()).unwrap_or_default(),
            ),
            AuditKind::PipelineAborted => format!(
                "{}|{}|{}",
                self.email_id,
                self.kind.as_str(),
                self.pipeline.as_deref().unwrap_or_default(),
            ),
        }
    }
}

/// Persisting, broadcasting audit trail.
pub struct AuditTrail {
    db: Arc<dyn Database>,
    tx: broadcast::Sender<AuditLogEntry>,
}

impl AuditTrail {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { db, tx }
    }

    /// Subscribe to newly appended entries.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditLogEntry> {
        self.tx.subscribe()
    }

    /// Record the classification of an email.
    ///
    /// Returns the stored entry and whether it was created by this call.
    pub async fn record_classification(
        &self,
        context: &EmailContext,
        decision: &RouteDecision,
    ) -> Result<(AuditLogEntry, bool), DatabaseError> {
        let mut entry =
            AuditLogEntry::new(context.id(), AuditKind::Classification, decision.route());
        entry.confidence = Some(decision.confidence());
        entry.rationale = Some(decision.rationale().to_string());

        if self.append(&entry).await? {
            return Ok((entry, true));
        }
        let existing = self
            .db
            .find_audit_entry(&entry.dedup_key())
            .await?
            .ok_or_else(|| {
                DatabaseError::Query(format!(
                    "classification for {} conflicted but was not found",
                    context.id()
                ))
            })?;
        Ok((existing, false))
    }

    /// Record an item reaching a terminal state.
    pub async fn record_item(
        &self,
        email_id: &str,
        route: Route,
        pipeline: &str,
        outcome: &ItemOutcome,
    ) -> Result<bool, DatabaseError> {
        if !outcome.state.is_terminal() {
            debug!(
                email_id,
                item_id = %outcome.item_id,
                state = outcome.state.as_str(),
                "Item outcome is not terminal, not audited"
            );
            return Ok(false);
        }
        let mut entry = AuditLogEntry::new(email_id, AuditKind::ItemTerminal, route);
        entry.pipeline = Some(pipeline.to_string());
        entry.item_id = Some(outcome.item_id.clone());
        entry.identity_key = outcome.record.as_ref().map(|r| r.key.clone());
        entry.state = Some(outcome.state);
        entry.reason = outcome.reason.clone();
        self.append(&entry).await
    }

    /// Record direct (non-delegated) handling of an email.
    pub async fn record_direct(
        &self,
        email_id: &str,
        route: Route,
        rationale: &str,
    ) -> Result<bool, DatabaseError> {
        let mut entry = AuditLogEntry::new(email_id, AuditKind::DirectHandled, route);
        entry.rationale = Some(rationale.to_string());
        self.append(&entry).await
    }

    /// Record a pipeline run that was aborted before its items finished.
    pub async fn record_aborted(
        &self,
        email_id: &str,
        route: Route,
        pipeline: &str,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        let mut entry = AuditLogEntry::new(email_id, AuditKind::PipelineAborted, route);
        entry.pipeline = Some(pipeline.to_string());
        entry.reason = Some(reason.to_string());
        self.append(&entry).await
    }

    /// All entries for one email, oldest first.
    pub async fn entries_for(&self, email_id: &str) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        self.db.list_audit_entries(email_id).await
    }

    async fn append(&self, entry: &AuditLogEntry) -> Result<bool, DatabaseError> {
        let inserted = self.db.insert_audit_entry(entry).await?;
        if inserted {
            // Broadcast; ok if nobody is listening
            let _ = self.tx.send(entry.clone());
        } else {
            debug!(
                email_id = %entry.email_id,
                kind = entry.kind.as_str(),
                "Audit entry already recorded"
            );
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::RejectionReason;
    use crate::store::LibSqlBackend;

    async fn trail() -> AuditTrail {
        AuditTrail::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn item_entries_are_deduplicated() {
        let trail = trail().await;
        let outcome = ItemOutcome::rejected("item-1", &RejectionReason::MissingDate);

        assert!(trail.record_item("m-1", Route::Concert, "events", &outcome).await.unwrap());
        assert!(!trail.record_item("m-1", Route::Concert, "events", &outcome).await.unwrap());

        let entries = trail.entries_for("m-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, Some(ItemState::Rejected));
        assert_eq!(entries[0].reason.as_deref(), Some("missing date"));
    }

    #[tokio::test]
    async fn different_states_are_distinct_entries() {
        let trail = trail().await;
        let failed = ItemOutcome::failed("item-1", "backend down");
        let rejected = ItemOutcome::rejected("item-1", &RejectionReason::MissingName);
        trail.record_item("m-2", Route::Other, "events", &failed).await.unwrap();
        trail.record_item("m-2", Route::Other, "events", &rejected).await.unwrap();
        assert_eq!(trail.entries_for("m-2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_terminal_outcome_is_not_audited() {
        let trail = trail().await;
        let mut outcome = ItemOutcome::failed("item-1", "still running");
        outcome.state = ItemState::Validated;

        assert!(!trail.record_item("m-7", Route::Concert, "events", &outcome).await.unwrap());
        assert!(trail.entries_for("m-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_new_entries_only() {
        let trail = trail().await;
        let mut rx = trail.subscribe();

        trail.record_direct("m-3", Route::Transactional, "receipt").await.unwrap();
        trail.record_direct("m-3", Route::Transactional, "receipt").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, AuditKind::DirectHandled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn entries_are_scoped_to_email() {
        let trail = trail().await;
        trail.record_aborted("m-4", Route::Concert, "events", "scope").await.unwrap();
        trail.record_direct("m-5", Route::Transactional, "receipt").await.unwrap();
        assert_eq!(trail.entries_for("m-4").await.unwrap().len(), 1);
        assert_eq!(trail.entries_for("m-5").await.unwrap().len(), 1);
        assert!(trail.entries_for("m-6").await.unwrap().is_empty());
    }

    #[test]
    fn dedup_key_shapes() {
        let mut entry = AuditLogEntry::new("m-1", AuditKind::ItemTerminal, Route::Concert);
        entry.pipeline = Some("events".into());
        entry.item_id = Some("item-9".into());
        entry.state = Some(ItemState::Scheduled);
        assert_eq!(entry.dedup_key(), "m-1|item_terminal|events|item-9|scheduled");

        let entry = AuditLogEntry::new("m-1", AuditKind::Classification, Route::Concert);
        assert_eq!(entry.dedup_key(), "m-1|classification");
    }
}
