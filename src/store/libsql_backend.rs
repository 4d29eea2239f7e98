//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLogEntry};
use crate::error::DatabaseError;
use crate::scheduler::ScheduleRecord;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map `Option<String>` to a libsql Value (Null or Text).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(f64::from(v)),
        None => libsql::Value::Null,
    }
}

const AUDIT_COLUMNS: &str = "id, email_id, kind, route, confidence, rationale, pipeline, \
     item_id, identity_key, state, reason, created_at";

fn row_to_audit_entry(row: &libsql::Row) -> Result<AuditLogEntry, DatabaseError> {
    let parse_err = |e: String| DatabaseError::Serialization(format!("audit row: {e}"));

    let id: String = row.get(0).map_err(|e| parse_err(e.to_string()))?;
    let email_id: String = row.get(1).map_err(|e| parse_err(e.to_string()))?;
    let kind: String = row.get(2).map_err(|e| parse_err(e.to_string()))?;
    let route: String = row.get(3).map_err(|e| parse_err(e.to_string()))?;
    let confidence: Option<f64> = row.get(4).ok();
    let state: Option<String> = row.get(9).ok();
    let created_at: String = row.get(11).map_err(|e| parse_err(e.to_string()))?;

    Ok(AuditLogEntry {
        id: Uuid::parse_str(&id).map_err(|e| parse_err(e.to_string()))?,
        email_id,
        kind: kind.parse::<AuditKind>().map_err(parse_err)?,
        route: route.parse().map_err(parse_err)?,
        confidence: confidence.map(|c| c as f32),
        rationale: row.get(5).ok(),
        pipeline: row.get(6).ok(),
        item_id: row.get(7).ok(),
        identity_key: row.get(8).ok(),
        state: state.map(|s| s.parse()).transpose().map_err(parse_err)?,
        reason: row.get(10).ok(),
        created_at: parse_datetime(&created_at),
    })
}

const SCHEDULE_COLUMNS: &str =
    "key, kind, title, remind_at, event_at, backend_ref, source_email_id, created_at";

fn row_to_schedule_record(row: &libsql::Row) -> Result<ScheduleRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Serialization(format!("schedule row: {e}"));

    let remind_at: String = row.get(3).map_err(parse_err)?;
    let event_at: Option<String> = row.get(4).ok();
    let created_at: String = row.get(7).map_err(parse_err)?;

    Ok(ScheduleRecord {
        key: row.get(0).map_err(parse_err)?,
        kind: row.get(1).map_err(parse_err)?,
        title: row.get(2).map_err(parse_err)?,
        remind_at: parse_datetime(&remind_at),
        event_at: event_at.as_deref().map(parse_datetime),
        backend_ref: row.get(5).map_err(parse_err)?,
        source_email_id: row.get(6).map_err(parse_err)?,
        created_at: parse_datetime(&created_at),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO audit_log (id, dedup_key, email_id, kind, route, confidence, rationale, \
                 pipeline, item_id, identity_key, state, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(dedup_key) DO NOTHING",
                params![
                    entry.id.to_string(),
                    entry.dedup_key(),
                    entry.email_id.as_str(),
                    entry.kind.as_str(),
                    entry.route.name(),
                    opt_real(entry.confidence),
                    opt_text(entry.rationale.as_deref()),
                    opt_text(entry.pipeline.as_deref()),
                    opt_text(entry.item_id.as_deref()),
                    opt_text(entry.identity_key.as_deref()),
                    opt_text(entry.state.map(|s| s.as_str())),
                    opt_text(entry.reason.as_deref()),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_audit_entry: {e}")))?;

        debug!(
            email_id = %entry.email_id,
            kind = entry.kind.as_str(),
            inserted = changed > 0,
            "Audit insert"
        );
        Ok(changed > 0)
    }

    async fn find_audit_entry(
        &self,
        dedup_key: &str,
    ) -> Result<Option<AuditLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE dedup_key = ?1"),
                params![dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_audit_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_audit_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_audit_entry: {e}"))),
        }
    }

    async fn list_audit_entries(
        &self,
        email_id: &str,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE email_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_audit_entries: {e}")))?
        {
            entries.push(row_to_audit_entry(&row)?);
        }
        Ok(entries)
    }

    // ── Schedule records ────────────────────────────────────────────

    async fn insert_schedule_record(&self, record: &ScheduleRecord) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO schedule_records (key, kind, title, remind_at, event_at, backend_ref, \
                 source_email_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(key) DO NOTHING",
                params![
                    record.key.as_str(),
                    record.kind.as_str(),
                    record.title.as_str(),
                    record.remind_at.to_rfc3339(),
                    opt_text(record.event_at.map(|t| t.to_rfc3339()).as_deref()),
                    record.backend_ref.as_str(),
                    record.source_email_id.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_schedule_record: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_schedule_record(
        &self,
        key: &str,
    ) -> Result<Option<ScheduleRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedule_records WHERE key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedule_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_schedule_record: {e}"))),
        }
    }

    async fn list_schedule_records(&self) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedule_records ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_schedule_records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_schedule_records: {e}")))?
        {
            records.push(row_to_schedule_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Route;

    fn record(key: &str) -> ScheduleRecord {
        ScheduleRecord {
            key: key.into(),
            kind: "event".into(),
            title: "Show".into(),
            remind_at: Utc::now(),
            event_at: Some(Utc::now()),
            backend_ref: "mem:1".into(),
            source_email_id: "m-1".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schedule_record_insert_if_absent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.insert_schedule_record(&record("k1")).await.unwrap());

        let mut dup = record("k1");
        dup.title = "Different".into();
        assert!(!db.insert_schedule_record(&dup).await.unwrap());

        let stored = db.get_schedule_record("k1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Show");
        assert_eq!(db.list_schedule_records().await.unwrap().len(), 1);
        assert!(db.get_schedule_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schedule_record_round_trips_times() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let original = record("k2");
        db.insert_schedule_record(&original).await.unwrap();
        assert_eq!(db.get_schedule_record("k2").await.unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn audit_entry_round_trip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            email_id: "m-1".into(),
            kind: AuditKind::Classification,
            route: Route::Concert,
            confidence: Some(1.0),
            rationale: Some("rule: event/ticket content".into()),
            pipeline: None,
            item_id: None,
            identity_key: None,
            state: None,
            reason: None,
            created_at: Utc::now(),
        };
        assert!(db.insert_audit_entry(&entry).await.unwrap());
        assert!(!db.insert_audit_entry(&entry).await.unwrap());

        let found = db.find_audit_entry("m-1|classification").await.unwrap().unwrap();
        assert_eq!(found.route, Route::Concert);
        assert_eq!(found.rationale.as_deref(), Some("rule: event/ticket content"));
        assert_eq!(db.list_audit_entries("m-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.insert_schedule_record(&record("k3")).await.unwrap();
        assert!(path.exists());
    }
}
