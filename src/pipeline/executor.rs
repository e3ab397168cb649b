//! Step execution: one attempt per step, bounded by a timeout, with the
//! outcome recorded in the run context and the execution log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use crate::error::{PipelineError, StepError};
use crate::pipeline::context::{RunContext, StepResult};
use crate::pipeline::registry::StepRegistry;
use crate::pipeline::step::StepDefinition;
use crate::store::{Database, LogStatus, MessageEntity};

/// Runs individual steps and whole levels against a run context.
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    db: Arc<dyn Database>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>, db: Arc<dyn Database>, default_timeout: Duration) -> Self {
        Self {
            registry,
            db,
            default_timeout,
        }
    }

    /// Run one step once and record the outcome.
    ///
    /// Non-retryable failures are absorbed: they land in `ctx.failed` and
    /// this returns `Ok`. A retryable failure returns `StepFailed`.
    pub async fn execute_step(
        &self,
        ctx: &mut RunContext,
        step_name: &str,
    ) -> Result<(), PipelineError> {
        let step = self.registry.get(step_name)?;
        let result = self.attempt(&step, Arc::clone(&ctx.entity)).await;
        settle(ctx, &step, result)
    }

    /// Run every step of a level concurrently and wait for all of them.
    ///
    /// All outcomes are recorded before returning. If any retryable step
    /// failed, the first such failure in level order is returned.
    pub async fn execute_level(
        &self,
        ctx: &mut RunContext,
        level: &[String],
    ) -> Result<(), PipelineError> {
        let steps = level
            .iter()
            .map(|name| self.registry.get(name))
            .collect::<Result<Vec<_>, _>>()?;

        let entity = Arc::clone(&ctx.entity);
        let results = join_all(
            steps
                .iter()
                .map(|step| self.attempt(step, Arc::clone(&entity))),
        )
        .await;

        let mut escalated = None;
        for (step, result) in steps.iter().zip(results) {
            if let Err(e) = settle(ctx, step, result) {
                escalated.get_or_insert(e);
            }
        }

        match escalated {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One attempt. The action runs on its own task; on timeout the handle
    /// is dropped and the task is left to finish in the background.
    async fn attempt(&self, step: &StepDefinition, entity: Arc<MessageEntity>) -> StepResult {
        let step_name = step.name();
        let timeout = step.timeout_value().unwrap_or(self.default_timeout);

        tracing::debug!(
            step = %step_name,
            entity = %entity.id,
            timeout_ms = timeout.as_millis() as u64,
            "Step started"
        );

        let started_at = Utc::now();
        let start = Instant::now();
        let action = step.action();
        let task_entity = Arc::clone(&entity);
        let handle = tokio::spawn(async move { action.run(&task_entity).await });

        let outcome: Result<(), String> = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => Err("step panicked".to_string()),
            Ok(Err(_)) => Err("step task was cancelled".to_string()),
            Err(_) => Err(StepError::Timeout(timeout).to_string()),
        };
        let elapsed = start.elapsed();

        let mut details = serde_json::json!({
            "duration_ms": elapsed.as_millis() as u64,
            "started_at": started_at.to_rfc3339(),
            "timeout_ms": timeout.as_millis() as u64,
            "retryable": step.is_retryable(),
        });

        let (result, log_status) = match outcome {
            Ok(()) => {
                tracing::info!(
                    step = %step_name,
                    entity = %entity.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Step completed"
                );
                (StepResult::ok(elapsed), LogStatus::Ok)
            }
            Err(reason) => {
                if step.is_retryable() {
                    tracing::error!(
                        step = %step_name,
                        entity = %entity.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %reason,
                        "Retryable step failed"
                    );
                } else {
                    tracing::warn!(
                        step = %step_name,
                        entity = %entity.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %reason,
                        "Step failed, continuing run"
                    );
                }
                details["error"] = serde_json::Value::String(reason.clone());
                (StepResult::failed(elapsed, reason), LogStatus::Error)
            }
        };

        if let Err(e) = self
            .db
            .append_execution_log(&entity.id, step_name, log_status, &details)
            .await
        {
            tracing::warn!(
                step = %step_name,
                entity = %entity.id,
                error = %e,
                "Failed to append execution log"
            );
        }

        result.with_metadata(details)
    }
}

/// Record the attempt in the context and decide whether it escalates.
fn settle(
    ctx: &mut RunContext,
    step: &StepDefinition,
    result: StepResult,
) -> Result<(), PipelineError> {
    let escalation = (!result.success && step.is_retryable()).then(|| PipelineError::StepFailed {
        step: step.name().to_string(),
        duration_ms: result.duration_ms,
        reason: result.error.clone().unwrap_or_default(),
    });
    ctx.record(step.name(), result);

    match escalation {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::step::Step;
    use crate::store::{LibSqlBackend, NewMessage};
    use async_trait::async_trait;

    struct Succeed;

    #[async_trait]
    impl Step for Succeed {
        async fn run(&self, _entity: &MessageEntity) -> Result<(), StepError> {
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Step for Fail {
        async fn run(&self, _entity: &MessageEntity) -> Result<(), StepError> {
            Err(StepError::Failed("boom".to_string()))
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl Step for Sleep {
        async fn run(&self, _entity: &MessageEntity) -> Result<(), StepError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Panic;

    #[async_trait]
    impl Step for Panic {
        async fn run(&self, _entity: &MessageEntity) -> Result<(), StepError> {
            panic!("step blew up");
        }
    }

    async fn setup(steps: Vec<StepDefinition>) -> (StepExecutor, Arc<dyn Database>, RunContext) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = db
            .insert_message(&NewMessage {
                external_id: "<exec@example.com>".to_string(),
                sender: "alice@example.com".to_string(),
                body_text: Some("hello".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let entity = db.load_entity(&id).await.unwrap().unwrap();

        let mut registry = StepRegistry::new();
        for step in steps {
            registry.register(step).unwrap();
        }
        let executor = StepExecutor::new(
            Arc::new(registry),
            Arc::clone(&db),
            Duration::from_secs(5),
        );
        (executor, db, RunContext::new(entity))
    }

    #[tokio::test]
    async fn test_success_recorded_and_logged() {
        let (executor, db, mut ctx) =
            setup(vec![StepDefinition::new("a", Arc::new(Succeed))]).await;

        executor.execute_step(&mut ctx, "a").await.unwrap();
        assert!(ctx.is_completed("a"));
        assert!(ctx.result("a").unwrap().success);

        let logs = db.list_execution_logs(&ctx.entity_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].step_name, "a");
        assert_eq!(logs[0].status, LogStatus::Ok);
        assert!(logs[0].details["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_absorbed() {
        let (executor, db, mut ctx) = setup(vec![StepDefinition::new("a", Arc::new(Fail))]).await;

        executor.execute_step(&mut ctx, "a").await.unwrap();
        assert!(ctx.is_failed("a"));
        assert_eq!(ctx.result("a").unwrap().error.as_deref(), Some("boom"));

        let logs = db.list_execution_logs(&ctx.entity_id).await.unwrap();
        assert_eq!(logs[0].status, LogStatus::Error);
        assert_eq!(logs[0].details["error"], "boom");
    }

    #[tokio::test]
    async fn test_retryable_failure_escalates() {
        let (executor, _db, mut ctx) =
            setup(vec![StepDefinition::new("a", Arc::new(Fail)).retryable(true)]).await;

        let err = executor.execute_step(&mut ctx, "a").await.unwrap_err();
        match err {
            PipelineError::StepFailed { step, reason, .. } => {
                assert_eq!(step, "a");
                assert_eq!(reason, "boom");
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        // Recorded before escalating.
        assert!(ctx.is_failed("a"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let (executor, db, mut ctx) = setup(vec![
            StepDefinition::new("slow", Arc::new(Sleep(Duration::from_secs(10))))
                .timeout(Duration::from_millis(50)),
        ])
        .await;

        let start = Instant::now();
        executor.execute_step(&mut ctx, "slow").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(ctx.is_failed("slow"));
        assert_eq!(
            ctx.result("slow").unwrap().error.as_deref(),
            Some("timed out after 50ms")
        );
        let logs = db.list_execution_logs(&ctx.entity_id).await.unwrap();
        assert_eq!(logs[0].details["error"], "timed out after 50ms");
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let (executor, _db, mut ctx) =
            setup(vec![StepDefinition::new("bad", Arc::new(Panic))]).await;

        executor.execute_step(&mut ctx, "bad").await.unwrap();
        assert_eq!(
            ctx.result("bad").unwrap().error.as_deref(),
            Some("step panicked")
        );
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let (executor, _db, mut ctx) = setup(vec![]).await;
        assert!(matches!(
            executor.execute_step(&mut ctx, "ghost").await,
            Err(PipelineError::UnknownStep(_))
        ));
        assert!(ctx.results.is_empty());
    }

    #[tokio::test]
    async fn test_level_runs_concurrently_and_records_all() {
        let (executor, _db, mut ctx) = setup(vec![
            StepDefinition::new("s1", Arc::new(Sleep(Duration::from_millis(300)))),
            StepDefinition::new("s2", Arc::new(Sleep(Duration::from_millis(300)))),
            StepDefinition::new("f", Arc::new(Fail)).retryable(true),
            StepDefinition::new("g", Arc::new(Fail)),
        ])
        .await;

        let level: Vec<String> = ["s1", "s2", "f", "g"].iter().map(|s| s.to_string()).collect();
        let start = Instant::now();
        let err = executor.execute_level(&mut ctx, &level).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(550));

        assert!(matches!(err, PipelineError::StepFailed { ref step, .. } if step == "f"));
        assert!(ctx.is_completed("s1"));
        assert!(ctx.is_completed("s2"));
        assert!(ctx.is_failed("f"));
        assert!(ctx.is_failed("g"));
    }
}
