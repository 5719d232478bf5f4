//! Admission control for inbound requests: nonce-based replay protection
//! and per-key sliding-window rate limiting.

pub mod rate_limit;
pub mod replay;
