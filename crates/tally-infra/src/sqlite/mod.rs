//! SQLite persistence.
//!
//! All repositories share one [`pool::DatabasePool`]. Writes go through the
//! single-connection writer pool; ledger-touching writes additionally hold
//! the ordered row locks from `tally_core::ledger::locks`.

pub mod chat;
#[cfg(any(test, feature = "test-support"))]
pub mod directory;
pub mod ledger;
pub mod pool;
pub mod session;

use chrono::{DateTime, SecondsFormat, Utc};
use tally_types::error::RepositoryError;

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_uuid(s: &str, what: &str) -> Result<uuid::Uuid, RepositoryError> {
    uuid::Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
}

/// True for UNIQUE / PRIMARY KEY violations.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() || db_err.message().contains("UNIQUE")
        }
        _ => false,
    }
}
