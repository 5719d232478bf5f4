//! Query parameter extractors for list endpoints.

use serde::Deserialize;

/// `?limit=` for conversation listing.
#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    /// Requested limit clamped to `1..=100`, default 20.
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }
}
