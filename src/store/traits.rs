//! Unified `Database` trait, a single async interface for all persistence.
//!
//! The pipeline core reads message entities and writes three kinds of
//! records through this trait: derived outputs, processing-status rows, and
//! append-only execution logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// A persisted inbound message, the unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    pub id: String,
    /// Channel-native identifier (RFC 822 Message-ID for email).
    pub external_id: String,
    /// Conversation this message belongs to, if known.
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A message ready to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub external_id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Kind of derived output a step produces for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    PlainText,
    Conversation,
    Summary,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::Conversation => "conversation",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartialFailure,
}

impl ProcessingStatus {
    /// Whether a run has finished in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartialFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialFailure => "partial_failure",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partial_failure" => Ok(Self::PartialFailure),
            other => Err(DatabaseError::Serialization(format!(
                "unknown processing status: {other}"
            ))),
        }
    }
}

/// Persistent per-entity processing status.
///
/// `completed_steps` / `failed_steps` accumulate across every run for the
/// entity; they are folded in by `append_execution_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatusRecord {
    pub entity_id: String,
    pub status: ProcessingStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome recorded for one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Ok,
    Error,
    Duplicate,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(DatabaseError::Serialization(format!(
                "unknown log status: {other}"
            ))),
        }
    }
}

/// Append-only execution log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogRecord {
    pub id: String,
    pub entity_id: String,
    pub step_name: String,
    pub status: LogStatus,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a new message. Returns the generated id.
    async fn insert_message(&self, message: &NewMessage) -> Result<String, DatabaseError>;

    /// Load a message entity by id.
    async fn load_entity(&self, id: &str) -> Result<Option<MessageEntity>, DatabaseError>;

    /// Look up a message by its external (channel-native) id.
    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<MessageEntity>, DatabaseError>;

    /// All messages in a thread, oldest first.
    async fn list_thread_messages(
        &self,
        thread_id: &str,
    ) -> Result<Vec<MessageEntity>, DatabaseError>;

    /// Messages that have never been run (no status row, or status `pending`), oldest first.
    async fn list_unprocessed_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageEntity>, DatabaseError>;

    // ── Derived outputs ─────────────────────────────────────────────

    /// Upsert a derived output keyed by (entity, kind).
    async fn save_output(
        &self,
        entity_id: &str,
        kind: OutputKind,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// Get a derived output.
    async fn get_output(
        &self,
        entity_id: &str,
        kind: OutputKind,
    ) -> Result<Option<String>, DatabaseError>;

    // ── Processing status ───────────────────────────────────────────

    /// Mark the start of a new run: status `processing`, `started_at` set to
    /// now even if a previous run never finished, `completed_at` cleared.
    async fn begin_run(
        &self,
        entity_id: &str,
        current_step: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Last-write-wins upsert of the run-level status and current step.
    ///
    /// Never touches the accumulated completed/failed arrays.
    async fn upsert_processing_status(
        &self,
        entity_id: &str,
        status: ProcessingStatus,
        current_step: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Get the status row for an entity.
    async fn get_processing_status(
        &self,
        entity_id: &str,
    ) -> Result<Option<ProcessingStatusRecord>, DatabaseError>;

    /// Administrative reset: status back to `pending`, arrays cleared.
    async fn reset_processing_status(&self, entity_id: &str) -> Result<(), DatabaseError>;

    // ── Execution logs ──────────────────────────────────────────────

    /// Insert a log record and fold it into the entity's status row.
    async fn append_execution_log(
        &self,
        entity_id: &str,
        step_name: &str,
        status: LogStatus,
        details: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// All log records for an entity, oldest first.
    async fn list_execution_logs(
        &self,
        entity_id: &str,
    ) -> Result<Vec<ExecutionLogRecord>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_status_roundtrips_through_str() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
            ProcessingStatus::PartialFailure,
        ] {
            let parsed: ProcessingStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProcessingStatus::Completed.is_terminal());
        assert!(ProcessingStatus::PartialFailure.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
        assert!(!ProcessingStatus::Pending.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessingStatus::PartialFailure).unwrap();
        assert_eq!(json, "\"partial_failure\"");
        let json = serde_json::to_string(&OutputKind::PlainText).unwrap();
        assert_eq!(json, "\"plain_text\"");
    }
}
