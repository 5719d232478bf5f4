//! Observability for Tally: subscriber setup and the span/field names used
//! across the pipeline.

pub mod attrs;
pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
