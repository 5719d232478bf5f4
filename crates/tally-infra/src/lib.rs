//! Infrastructure implementations for Tally.
//!
//! Implements the ports from `tally-core`: SQLite repositories for the credit
//! ledger, chats and sessions; the HMAC request signer/verifier; and the two
//! HTTP upstreams (the signed gateway client used by the product service and
//! the OpenAI-compatible provider used by the gateway).

pub mod config;
pub mod gateway;
pub mod provider;
pub mod security;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod test_support;
