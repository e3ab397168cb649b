//! Step contract and static step definitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StepError;
use crate::store::MessageEntity;

/// A unit of pipeline work.
///
/// Implementations write their results to the store's derived-output area
/// and must be safe to re-run against the same entity state.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, entity: &MessageEntity) -> Result<(), StepError>;
}

/// Static description of a registered step.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    dependencies: Vec<String>,
    retryable: bool,
    priority: i32,
    timeout: Option<Duration>,
    action: Arc<dyn Step>,
}

impl StepDefinition {
    /// New step with no dependencies, non-retryable, priority 0, default timeout.
    pub fn new(name: impl Into<String>, action: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            retryable: false,
            priority: 0,
            timeout: None,
            action,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Retryable failures escalate out of the run; others are absorbed.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Display ordering only; has no effect on scheduling.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn priority_value(&self) -> i32 {
        self.priority
    }

    /// Configured timeout, or `None` to use the executor default.
    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn action(&self) -> Arc<dyn Step> {
        Arc::clone(&self.action)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retryable", &self.retryable)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
