//! Per-run mutable state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::MessageEntity;

/// Outcome of a single step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StepResult {
    pub fn ok(duration: Duration) -> Self {
        Self {
            success: true,
            error: None,
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failed(duration: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// State of one orchestrated run for one entity.
///
/// A step name is in at most one of `completed` and `failed`, and has a
/// `results` entry iff it is in one of them.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub entity_id: String,
    pub entity: Arc<MessageEntity>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub results: HashMap<String, StepResult>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(entity: MessageEntity) -> Self {
        Self {
            entity_id: entity.id.clone(),
            entity: Arc::new(entity),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            results: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Record an attempt outcome, replacing any earlier one for the step.
    pub fn record(&mut self, step: &str, result: StepResult) {
        if result.success {
            self.failed.remove(step);
            self.completed.insert(step.to_string());
        } else {
            self.completed.remove(step);
            self.failed.insert(step.to_string());
        }
        self.results.insert(step.to_string(), result);
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed.contains(step)
    }

    pub fn is_failed(&self, step: &str) -> bool {
        self.failed.contains(step)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.results.get(step)
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}
