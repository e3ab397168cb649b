//! Background pipeline worker.
//!
//! Timer-based loop:
//! 1. `list_unprocessed_messages()` from DB (no status row, or `pending`)
//! 2. `Orchestrator::execute_all()` for each, one entity at a time
//!
//! A run leaves its entity in a terminal status, so entities that failed are
//! not picked up again until someone re-runs them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::orchestrator::Orchestrator;
use crate::store::Database;

/// Summary of one worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
}

impl TickReport {
    pub fn total(&self) -> usize {
        self.completed + self.partial + self.failed
    }
}

/// Spawn a background task that runs the full pipeline over new messages.
///
/// Returns a `JoinHandle` and shutdown flag. The flag is checked once per
/// tick, so shutdown takes effect at the next interval boundary.
pub fn spawn_pipeline_worker(
    db: Arc<dyn Database>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    batch_size: usize,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            batch_size, "Pipeline worker started"
        );

        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately.
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Pipeline worker shutting down");
                return;
            }

            process_batch(db.as_ref(), &orchestrator, batch_size).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run the pipeline over one batch of unprocessed messages.
pub async fn process_batch(
    db: &dyn Database,
    orchestrator: &Orchestrator,
    batch_size: usize,
) -> TickReport {
    let mut report = TickReport::default();

    let pending = match db.list_unprocessed_messages(batch_size).await {
        Ok(msgs) => msgs,
        Err(e) => {
            error!("Failed to fetch unprocessed messages: {e}");
            return report;
        }
    };

    if pending.is_empty() {
        debug!("No unprocessed messages");
        return report;
    }

    info!("Processing {} message(s)", pending.len());

    for message in pending {
        match orchestrator.execute_all(&message.id).await {
            Ok(ctx) if ctx.has_failures() => {
                warn!(
                    id = %message.id,
                    failed = ?ctx.failed,
                    "Message processed with step failures"
                );
                report.partial += 1;
            }
            Ok(_) => {
                debug!(id = %message.id, "Message processed");
                report.completed += 1;
            }
            Err(PipelineError::RunAborted { source, .. }) => {
                error!(id = %message.id, error = %source, "Pipeline run aborted");
                report.failed += 1;
            }
            Err(e) => {
                error!(id = %message.id, error = %e, "Pipeline run failed");
                report.failed += 1;
            }
        }
    }

    info!(
        completed = report.completed,
        partial = report.partial,
        failed = report.failed,
        "Worker batch finished"
    );
    report
}
