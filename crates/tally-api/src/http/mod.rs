//! HTTP layer for Tally.
//!
//! Two routers share this module: the client-facing product API (session
//! auth, envelope responses) and the internal gateway (signed requests,
//! `{"error": ...}` bodies).

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod router;
pub mod sse;

#[cfg(test)]
pub(crate) mod test_support;
