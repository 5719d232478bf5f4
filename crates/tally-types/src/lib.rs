//! Shared domain types for Tally.
//!
//! Everything here is plain data: serde-serializable structs, lowercase string
//! enums that round-trip through SQLite `TEXT` columns, and the closed error
//! enums each component reports. No IO and no async.

pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod upstream;
