//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;

use crate::audit::AuditLogEntry;
use crate::error::DatabaseError;
use crate::scheduler::ScheduleRecord;

/// Backend-agnostic database trait covering the audit log and schedule records.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    /// Append an entry unless one with the same dedup key exists.
    /// Returns `true` if a row was inserted.
    async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<bool, DatabaseError>;

    /// Look up an entry by its dedup key.
    async fn find_audit_entry(&self, dedup_key: &str)
    -> Result<Option<AuditLogEntry>, DatabaseError>;

    /// All entries for one email, oldest first.
    async fn list_audit_entries(&self, email_id: &str) -> Result<Vec<AuditLogEntry>, DatabaseError>;

    // ── Schedule records ────────────────────────────────────────────

    /// Insert a record unless its key exists. Returns `true` if inserted.
    async fn insert_schedule_record(&self, record: &ScheduleRecord) -> Result<bool, DatabaseError>;

    /// Get a record by identity key.
    async fn get_schedule_record(&self, key: &str) -> Result<Option<ScheduleRecord>, DatabaseError>;

    /// All records, most recently created first.
    async fn list_schedule_records(&self) -> Result<Vec<ScheduleRecord>, DatabaseError>;
}
