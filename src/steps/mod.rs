//! Concrete pipeline steps and the default registry wiring.
//!
//! ```text
//! strip_html → aggregate_conversation → summarize
//! ```
//!
//! `summarize` is only registered when an LLM provider is configured.

pub mod aggregate;
pub mod strip_html;
pub mod summarize;

use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::llm::LlmProvider;
use crate::pipeline::{StepDefinition, StepRegistry};
use crate::scrub::Scrubber;
use crate::store::Database;

pub use aggregate::AggregateConversationStep;
pub use strip_html::StripHtmlStep;
pub use summarize::{Summary, SummarizeStep};

/// Timeout for the LLM-backed summarize step.
pub const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(90);

/// Registry with the built-in steps.
pub fn default_registry(
    db: Arc<dyn Database>,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Result<StepRegistry, PipelineError> {
    let scrubber = Arc::new(Scrubber::default_rules());
    let mut registry = StepRegistry::new();

    registry.register(
        StepDefinition::new(
            strip_html::NAME,
            Arc::new(StripHtmlStep::new(Arc::clone(&db), Arc::clone(&scrubber))),
        )
        .priority(10),
    )?;

    registry.register(
        StepDefinition::new(
            aggregate::NAME,
            Arc::new(AggregateConversationStep::new(
                Arc::clone(&db),
                Arc::clone(&scrubber),
            )),
        )
        .depends_on([strip_html::NAME])
        .priority(20),
    )?;

    match llm {
        Some(llm) => {
            registry.register(
                StepDefinition::new(summarize::NAME, Arc::new(SummarizeStep::new(db, llm)))
                    .depends_on([aggregate::NAME])
                    .retryable(true)
                    .priority(30)
                    .timeout(SUMMARIZE_TIMEOUT),
            )?;
        }
        None => {
            tracing::info!("No LLM configured, summarize step disabled");
        }
    }

    Ok(registry)
}
