//! Run orchestration for a single entity.
//!
//! A run loads the entity, plans the requested steps, then dispatches the
//! plan level by level. The persisted status moves through
//! `processing` → `completed` | `partial_failure` | `failed`; status writes
//! are best-effort and never change the outcome of the run.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::context::RunContext;
use crate::pipeline::executor::StepExecutor;
use crate::pipeline::planner::{self, ExecutionPlan};
use crate::pipeline::registry::StepRegistry;
use crate::store::{Database, ProcessingStatus};

/// Upper bound on a single status write.
const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives step runs for entities.
pub struct Orchestrator {
    registry: Arc<StepRegistry>,
    db: Arc<dyn Database>,
    executor: StepExecutor,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StepRegistry>,
        db: Arc<dyn Database>,
        default_step_timeout: Duration,
    ) -> Self {
        let executor = StepExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&db),
            default_step_timeout,
        );
        Self {
            registry,
            db,
            executor,
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run every registered step for an entity.
    pub async fn execute_all(&self, entity_id: &str) -> Result<RunContext, PipelineError> {
        self.execute_steps(entity_id, None, false).await
    }

    /// Run `requested` steps (all registered steps when `None`) for an entity.
    ///
    /// Dependencies of the requested steps are pulled in unless
    /// `skip_dependencies` is set. Returns the final context when every
    /// level was dispatched, even if non-retryable steps failed. A retryable
    /// failure stops the run and comes back as `RunAborted`, carrying the
    /// context as it stood at that point.
    pub async fn execute_steps(
        &self,
        entity_id: &str,
        requested: Option<&[String]>,
        skip_dependencies: bool,
    ) -> Result<RunContext, PipelineError> {
        let entity = self
            .db
            .load_entity(entity_id)
            .await?
            .ok_or_else(|| PipelineError::EntityNotFound(entity_id.to_string()))?;

        let plan = self.plan_for(requested, skip_dependencies)?;
        let mut ctx = RunContext::new(entity);

        tracing::info!(
            entity = %entity_id,
            steps = plan.step_count(),
            levels = plan.levels.len(),
            "Pipeline run started"
        );

        let begin = self.db.begin_run(entity_id, plan.first_step());
        self.settle_status_write(entity_id, ProcessingStatus::Processing, begin)
            .await;

        for (index, level) in plan.levels.iter().enumerate() {
            if index > 0 {
                self.write_status(
                    entity_id,
                    ProcessingStatus::Processing,
                    level.first().map(String::as_str),
                )
                .await;
            }

            if let Err(e) = self.executor.execute_level(&mut ctx, level).await {
                let failed_step = match &e {
                    PipelineError::StepFailed { step, .. } => Some(step.clone()),
                    _ => level.first().cloned(),
                };
                tracing::error!(
                    entity = %entity_id,
                    level = index,
                    error = %e,
                    "Pipeline run aborted"
                );
                self.write_status(entity_id, ProcessingStatus::Failed, failed_step.as_deref())
                    .await;
                return Err(PipelineError::RunAborted {
                    context: Box::new(ctx),
                    source: Box::new(e),
                });
            }
        }

        let final_status = if ctx.has_failures() {
            ProcessingStatus::PartialFailure
        } else {
            ProcessingStatus::Completed
        };
        self.write_status(entity_id, final_status, None).await;

        tracing::info!(
            entity = %entity_id,
            status = %final_status,
            completed = ctx.completed.len(),
            failed = ctx.failed.len(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );

        Ok(ctx)
    }

    fn plan_for(
        &self,
        requested: Option<&[String]>,
        skip_dependencies: bool,
    ) -> Result<ExecutionPlan, PipelineError> {
        match requested {
            None => planner::plan(&self.registry, &self.registry.step_names(), true),
            Some(names) => planner::plan(&self.registry, names, !skip_dependencies),
        }
    }

    /// Best-effort status write; failures and stalls are logged and dropped.
    async fn write_status(
        &self,
        entity_id: &str,
        status: ProcessingStatus,
        current_step: Option<&str>,
    ) {
        let write = self
            .db
            .upsert_processing_status(entity_id, status, current_step);
        self.settle_status_write(entity_id, status, write).await;
    }

    async fn settle_status_write(
        &self,
        entity_id: &str,
        status: ProcessingStatus,
        write: impl Future<Output = Result<(), DatabaseError>>,
    ) {
        match tokio::time::timeout(STATUS_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    entity = %entity_id,
                    status = %status,
                    error = %e,
                    "Failed to persist processing status"
                );
            }
            Err(_) => {
                tracing::warn!(
                    entity = %entity_id,
                    status = %status,
                    "Timed out persisting processing status"
                );
            }
        }
    }
}
