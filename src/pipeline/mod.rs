//! Dependency-aware processing pipeline.
//!
//! Every message entity flows through:
//! 1. `planner::plan()`: resolve requested steps, topologically sort, group into levels
//! 2. `StepExecutor::execute_level()`: run a level's steps concurrently, each under a timeout
//! 3. `Orchestrator`: drive levels in order and keep the persisted status current
//!
//! Steps are registered once at startup in a `StepRegistry`, which rejects
//! dependency cycles. A non-retryable step failure is recorded and the run
//! continues; a retryable one stops the run before the next level.

pub mod context;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod step;
pub mod worker;

pub use context::{RunContext, StepResult};
pub use executor::StepExecutor;
pub use orchestrator::Orchestrator;
pub use planner::{ExecutionPlan, plan};
pub use registry::StepRegistry;
pub use step::{Step, StepDefinition};
pub use worker::spawn_pipeline_worker;
