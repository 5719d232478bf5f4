//! Business logic and port traits for Tally.
//!
//! This crate defines the ports (repository, upstream, identity traits) that
//! the infrastructure layer implements, plus the pieces of the pipeline that
//! need no IO: the replay guard, the rate limiter, the ledger's row-lock
//! table, the chat state machine and the streaming relay. It depends only on
//! `tally-types`, never on `tally-infra` or any database/HTTP crate.

pub mod chat;
pub mod identity;
pub mod ledger;
pub mod security;
pub mod upstream;
