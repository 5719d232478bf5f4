//! Chat turn lifecycle.
//!
//! - [`repository`]: the persistence port, including the transactional
//!   "insert turn and bill it" operation.
//! - [`service`]: the state machine driving one submission from
//!   idempotency lookup to terminal outcome.
//! - [`relay`]: forwards upstream events to a client channel and reports
//!   how the stream ended.

pub mod relay;
pub mod repository;
pub mod service;
