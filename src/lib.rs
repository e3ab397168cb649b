//! mailflow: email ingestion and a dependency-aware processing pipeline.

pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod scrub;
pub mod steps;
pub mod store;
