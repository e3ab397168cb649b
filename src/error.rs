//! Error types for mailflow.

use std::time::Duration;

use crate::pipeline::context::RunContext;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
}

/// Errors returned by a step action.
///
/// Every variant is a normal step failure as far as the executor is
/// concerned; the step's `retryable` flag decides whether it escalates.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("storage: {0}")]
    Database(#[from] DatabaseError),

    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

/// Pipeline registration, planning, and run errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid step definition {name:?}: {reason}")]
    InvalidStepDefinition { name: String, reason: String },

    #[error("Cyclic dependency detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// A step attempt failed; carries the step name and how long it ran.
    #[error("Step {step} failed after {duration_ms}ms: {reason}")]
    StepFailed {
        step: String,
        duration_ms: u64,
        reason: String,
    },

    /// A retryable step failed and the run stopped dispatching further levels.
    ///
    /// The context reflects everything that happened before the abort.
    #[error("Run for entity {} aborted: {source}", .context.entity_id)]
    RunAborted {
        context: Box<RunContext>,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors while turning raw mail into message entities.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unparseable message: {0}")]
    Unparseable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
