//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. The execution-log fold into
//! `processing_status` is done by a trigger installed in migration V3.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, ExecutionLogRecord, LogStatus, MessageEntity, NewMessage, OutputKind,
    ProcessingStatus, ProcessingStatusRecord,
};

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
        if let Some(parent) = path.parent() {
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
        backend.init_schema().await?;
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
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<MessageEntity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_step_array(column: &str, s: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column} is not a JSON string array: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a MessageEntity.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<MessageEntity, libsql::Error> {
    let received_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(MessageEntity {
        id: row.get(0)?,
        external_id: row.get(1)?,
        thread_id: row.get::<String>(2).ok(),
        sender: row.get(3)?,
        subject: row.get::<String>(4).ok(),
        body_text: row.get::<String>(5).ok(),
        body_html: row.get::<String>(6).ok(),
        received_at: parse_datetime(&received_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_status(row: &libsql::Row) -> Result<ProcessingStatusRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("status row parse: {e}"));

    let status_str: String = row.get(1).map_err(parse)?;
    let completed: String = row.get(3).map_err(parse)?;
    let failed: String = row.get(4).map_err(parse)?;
    let updated_str: String = row.get(7).map_err(parse)?;

    Ok(ProcessingStatusRecord {
        entity_id: row.get(0).map_err(parse)?,
        status: status_str.parse()?,
        current_step: row.get::<String>(2).ok(),
        completed_steps: parse_step_array("completed_steps", &completed)?,
        failed_steps: parse_step_array("failed_steps", &failed)?,
        started_at: parse_optional_datetime(&row.get::<String>(5).ok()),
        completed_at: parse_optional_datetime(&row.get::<String>(6).ok()),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<ExecutionLogRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("log row parse: {e}"));

    let status_str: String = row.get(3).map_err(parse)?;
    let details_str: String = row.get(4).map_err(parse)?;
    let created_str: String = row.get(5).map_err(parse)?;

    Ok(ExecutionLogRecord {
        id: row.get(0).map_err(parse)?,
        entity_id: row.get(1).map_err(parse)?,
        step_name: row.get(2).map_err(parse)?,
        status: status_str.parse()?,
        details: serde_json::from_str(&details_str)
            .map_err(|e| DatabaseError::Serialization(format!("log details: {e}")))?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, external_id, thread_id, sender, subject, body_text, body_html, received_at, created_at";

const STATUS_COLUMNS: &str = "entity_id, status, current_step, completed_steps, failed_steps, started_at, completed_at, updated_at";

const LOG_COLUMNS: &str = "id, entity_id, step_name, status, details, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &NewMessage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let received_at = message.received_at.unwrap_or(now);

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    id.clone(),
                    message.external_id.as_str(),
                    opt_text(message.thread_id.as_deref()),
                    message.sender.as_str(),
                    opt_text(message.subject.as_deref()),
                    opt_text(message.body_text.as_deref()),
                    opt_text(message.body_html.as_deref()),
                    received_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(id = %id, external_id = %message.external_id, "Message inserted into DB");
        Ok(id)
    }

    async fn load_entity(&self, id: &str) -> Result<Option<MessageEntity>, DatabaseError> {
        let mut found = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                "load_entity",
            )
            .await?;
        Ok(found.pop())
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<MessageEntity>, DatabaseError> {
        let mut found = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
                params![external_id],
                "get_message_by_external_id",
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_thread_messages(
        &self,
        thread_id: &str,
    ) -> Result<Vec<MessageEntity>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY received_at ASC, created_at ASC"
            ),
            params![thread_id],
            "list_thread_messages",
        )
        .await
    }

    async fn list_unprocessed_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageEntity>, DatabaseError> {
        let columns = MESSAGE_COLUMNS
            .split(", ")
            .map(|c| format!("m.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_messages(
            &format!(
                "SELECT {columns} FROM messages m
                 LEFT JOIN processing_status p ON p.entity_id = m.id
                 WHERE p.entity_id IS NULL OR p.status = 'pending'
                 ORDER BY m.received_at ASC
                 LIMIT ?1"
            ),
            params![limit as i64],
            "list_unprocessed_messages",
        )
        .await
    }

    // ── Derived outputs ─────────────────────────────────────────────

    async fn save_output(
        &self,
        entity_id: &str,
        kind: OutputKind,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO derived_outputs (entity_id, kind, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id, kind) DO UPDATE SET
                    content = excluded.content,
                    updated_at = excluded.updated_at",
                params![entity_id, kind.as_str(), content, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_output: {e}")))?;

        debug!(entity_id = entity_id, kind = %kind, "Derived output saved");
        Ok(())
    }

    async fn get_output(
        &self,
        entity_id: &str,
        kind: OutputKind,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT content FROM derived_outputs WHERE entity_id = ?1 AND kind = ?2",
                params![entity_id, kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_output: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let content: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_output row parse: {e}")))?;
                Ok(Some(content))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_output: {e}"))),
        }
    }

    // ── Processing status ───────────────────────────────────────────

    async fn begin_run(
        &self,
        entity_id: &str,
        current_step: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO processing_status (entity_id, status, current_step, started_at, completed_at, updated_at)
                 VALUES (?1, 'processing', ?2, ?3, NULL, ?3)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    status = 'processing',
                    current_step = excluded.current_step,
                    started_at = excluded.started_at,
                    completed_at = NULL,
                    updated_at = excluded.updated_at",
                params![entity_id, opt_text(current_step), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_run: {e}")))?;

        debug!(entity_id = entity_id, current_step = ?current_step, "Run started");
        Ok(())
    }

    async fn upsert_processing_status(
        &self,
        entity_id: &str,
        status: ProcessingStatus,
        current_step: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let started_at = (status == ProcessingStatus::Processing).then_some(now);
        let completed_at = status.is_terminal().then_some(now);

        // started_at only moves when a run begins; re-asserting `processing`
        // mid-run (current-step updates) keeps the original start time.
        self.conn()
            .execute(
                "INSERT INTO processing_status (entity_id, status, current_step, started_at, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    status = excluded.status,
                    current_step = excluded.current_step,
                    started_at = CASE
                        WHEN excluded.status = 'processing' AND processing_status.status != 'processing'
                            THEN excluded.started_at
                        ELSE processing_status.started_at
                    END,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at",
                params![
                    entity_id,
                    status.as_str(),
                    opt_text(current_step),
                    opt_datetime(started_at),
                    opt_datetime(completed_at),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_processing_status: {e}")))?;

        debug!(entity_id = entity_id, status = %status, current_step = ?current_step, "Processing status upserted");
        Ok(())
    }

    async fn get_processing_status(
        &self,
        entity_id: &str,
    ) -> Result<Option<ProcessingStatusRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STATUS_COLUMNS} FROM processing_status WHERE entity_id = ?1"),
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processing_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_status(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_processing_status: {e}"))),
        }
    }

    async fn reset_processing_status(&self, entity_id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE processing_status SET
                    status = 'pending',
                    current_step = NULL,
                    completed_steps = '[]',
                    failed_steps = '[]',
                    started_at = NULL,
                    completed_at = NULL,
                    updated_at = ?2
                 WHERE entity_id = ?1",
                params![entity_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_processing_status: {e}")))?;

        info!(entity_id = entity_id, "Processing status reset");
        Ok(())
    }

    // ── Execution logs ──────────────────────────────────────────────

    async fn append_execution_log(
        &self,
        entity_id: &str,
        step_name: &str,
        status: LogStatus,
        details: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let details_json = serde_json::to_string(details)
            .map_err(|e| DatabaseError::Serialization(format!("log details: {e}")))?;

        self.conn()
            .execute(
                &format!("INSERT INTO execution_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    id,
                    entity_id,
                    step_name,
                    status.as_str(),
                    details_json,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_execution_log: {e}")))?;

        debug!(entity_id = entity_id, step = step_name, status = status.as_str(), "Execution log appended");
        Ok(())
    }

    async fn list_execution_logs(
        &self,
        entity_id: &str,
    ) -> Result<Vec<ExecutionLogRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM execution_logs WHERE entity_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_execution_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_execution_logs: {e}")))?
        {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_message(external_id: &str, thread_id: Option<&str>) -> NewMessage {
        NewMessage {
            external_id: external_id.to_string(),
            thread_id: thread_id.map(String::from),
            sender: "alice@example.com".to_string(),
            subject: Some("Quarterly numbers".to_string()),
            body_text: Some("See attached.".to_string()),
            body_html: None,
            received_at: Some(Utc::now()),
        }
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_load_entity() {
        let db = test_db().await;
        let id = db.insert_message(&new_message("<a@x>", Some("t1"))).await.unwrap();

        let entity = db.load_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.id, id);
        assert_eq!(entity.external_id, "<a@x>");
        assert_eq!(entity.thread_id.as_deref(), Some("t1"));
        assert_eq!(entity.subject.as_deref(), Some("Quarterly numbers"));
        assert_eq!(entity.body_html, None);
    }

    #[tokio::test]
    async fn load_missing_entity_is_none() {
        let db = test_db().await;
        assert!(db.load_entity("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn external_id_is_unique() {
        let db = test_db().await;
        db.insert_message(&new_message("<dup@x>", None)).await.unwrap();
        assert!(db.insert_message(&new_message("<dup@x>", None)).await.is_err());

        let found = db.get_message_by_external_id("<dup@x>").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn thread_messages_in_received_order() {
        let db = test_db().await;
        let mut later = new_message("<2@x>", Some("t"));
        later.received_at = Some(Utc::now());
        let mut earlier = new_message("<1@x>", Some("t"));
        earlier.received_at = Some(Utc::now() - chrono::Duration::hours(1));
        db.insert_message(&later).await.unwrap();
        db.insert_message(&earlier).await.unwrap();
        db.insert_message(&new_message("<3@x>", Some("other"))).await.unwrap();

        let thread = db.list_thread_messages("t").await.unwrap();
        let ids: Vec<_> = thread.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["<1@x>", "<2@x>"]);
    }

    #[tokio::test]
    async fn unprocessed_excludes_started_runs() {
        let db = test_db().await;
        let a = db.insert_message(&new_message("<a@x>", None)).await.unwrap();
        let b = db.insert_message(&new_message("<b@x>", None)).await.unwrap();
        let c = db.insert_message(&new_message("<c@x>", None)).await.unwrap();

        db.upsert_processing_status(&a, ProcessingStatus::Completed, None)
            .await
            .unwrap();
        db.upsert_processing_status(&b, ProcessingStatus::Pending, None)
            .await
            .unwrap();

        let pending: Vec<_> = db
            .list_unprocessed_messages(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert!(!pending.contains(&a));
        assert!(pending.contains(&b));
        assert!(pending.contains(&c));
    }

    // ── Output tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn save_output_upserts() {
        let db = test_db().await;
        let id = db.insert_message(&new_message("<o@x>", None)).await.unwrap();

        db.save_output(&id, OutputKind::PlainText, "first").await.unwrap();
        db.save_output(&id, OutputKind::PlainText, "second").await.unwrap();

        let out = db.get_output(&id, OutputKind::PlainText).await.unwrap();
        assert_eq!(out.as_deref(), Some("second"));
        assert!(db.get_output(&id, OutputKind::Summary).await.unwrap().is_none());
    }

    // ── Status + log tests ──────────────────────────────────────────

    #[tokio::test]
    async fn first_log_write_creates_pending_status() {
        let db = test_db().await;
        db.append_execution_log("e1", "strip_html", LogStatus::Ok, &serde_json::json!({}))
            .await
            .unwrap();

        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Pending);
        assert_eq!(status.completed_steps, vec!["strip_html"]);
        assert!(status.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn log_fold_moves_step_between_arrays() {
        let db = test_db().await;
        let details = serde_json::json!({"duration_ms": 3});

        db.append_execution_log("e1", "summarize", LogStatus::Error, &details)
            .await
            .unwrap();
        db.append_execution_log("e1", "summarize", LogStatus::Error, &details)
            .await
            .unwrap();
        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.failed_steps, vec!["summarize"]);
        assert!(status.completed_steps.is_empty());

        db.append_execution_log("e1", "summarize", LogStatus::Ok, &details)
            .await
            .unwrap();
        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.completed_steps, vec!["summarize"]);
        assert!(status.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn duplicate_log_leaves_arrays_alone() {
        let db = test_db().await;
        db.append_execution_log("e1", "ingest", LogStatus::Duplicate, &serde_json::json!({}))
            .await
            .unwrap();

        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert!(status.completed_steps.is_empty());
        assert!(status.failed_steps.is_empty());

        let logs = db.list_execution_logs("e1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Duplicate);
    }

    #[tokio::test]
    async fn upsert_preserves_step_arrays() {
        let db = test_db().await;
        db.append_execution_log("e1", "a", LogStatus::Ok, &serde_json::json!({}))
            .await
            .unwrap();
        db.upsert_processing_status("e1", ProcessingStatus::Processing, Some("b"))
            .await
            .unwrap();

        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Processing);
        assert_eq!(status.current_step.as_deref(), Some("b"));
        assert_eq!(status.completed_steps, vec!["a"]);
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_none());
    }

    #[tokio::test]
    async fn started_at_kept_across_mid_run_updates() {
        let db = test_db().await;
        db.upsert_processing_status("e1", ProcessingStatus::Processing, Some("a"))
            .await
            .unwrap();
        let first = db.get_processing_status("e1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.upsert_processing_status("e1", ProcessingStatus::Processing, Some("b"))
            .await
            .unwrap();
        let second = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(first.started_at, second.started_at);

        db.upsert_processing_status("e1", ProcessingStatus::Completed, None)
            .await
            .unwrap();
        let done = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(done.started_at, first.started_at);
        assert!(done.completed_at.is_some());
        assert_eq!(done.current_step, None);
    }

    #[tokio::test]
    async fn begin_run_replaces_stale_start() {
        let db = test_db().await;
        db.append_execution_log("e1", "a", LogStatus::Ok, &serde_json::json!({}))
            .await
            .unwrap();
        db.upsert_processing_status("e1", ProcessingStatus::Processing, Some("b"))
            .await
            .unwrap();
        let stale = db.get_processing_status("e1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        db.begin_run("e1", Some("a")).await.unwrap();

        let fresh = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(fresh.status, ProcessingStatus::Processing);
        assert_eq!(fresh.current_step.as_deref(), Some("a"));
        assert!(fresh.started_at.unwrap() > stale.started_at.unwrap());
        assert!(fresh.completed_at.is_none());
        assert_eq!(fresh.completed_steps, vec!["a"]);
    }

    #[tokio::test]
    async fn begin_run_creates_missing_row() {
        let db = test_db().await;
        db.begin_run("e1", None).await.unwrap();

        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Processing);
        assert!(status.started_at.is_some());
        assert!(status.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn corrupt_step_array_is_an_error() {
        let db = test_db().await;
        db.begin_run("e1", None).await.unwrap();
        db.conn()
            .execute(
                "UPDATE processing_status SET failed_steps = 'not json' WHERE entity_id = 'e1'",
                (),
            )
            .await
            .unwrap();

        let result = db.get_processing_status("e1").await;
        assert!(matches!(result, Err(DatabaseError::Serialization(_))));
    }

    #[tokio::test]
    async fn reset_clears_arrays() {
        let db = test_db().await;
        db.append_execution_log("e1", "a", LogStatus::Error, &serde_json::json!({}))
            .await
            .unwrap();
        db.upsert_processing_status("e1", ProcessingStatus::PartialFailure, None)
            .await
            .unwrap();

        db.reset_processing_status("e1").await.unwrap();
        let status = db.get_processing_status("e1").await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Pending);
        assert!(status.failed_steps.is_empty());
        assert!(status.completed_at.is_none());
    }

    #[tokio::test]
    async fn log_details_roundtrip() {
        let db = test_db().await;
        let details = serde_json::json!({"duration_ms": 12, "error": "boom"});
        db.append_execution_log("e1", "a", LogStatus::Error, &details)
            .await
            .unwrap();

        let logs = db.list_execution_logs("e1").await.unwrap();
        assert_eq!(logs[0].details, details);
        assert_eq!(logs[0].step_name, "a");
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("test.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
