//! Credit ledger types.
//!
//! The ledger is append-only. A company's pool balance is always the sum of
//! its ledger deltas; nothing in this crate stores a balance directly.
//! Per-user allocations live in [`UserCreditLimit`] rows, which are the only
//! mutable part of the credit model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::UserRole;

/// Reason code for the debit recorded when a chat turn is billed.
pub const REASON_CHAT_MESSAGE: &str = "chat_message";

/// Default reason code for administrative grants.
pub const REASON_GRANT: &str = "grant";

/// Idempotency key for the reservation that bills a chat turn.
///
/// One assistant message is billed at most once because this key is unique
/// across the whole ledger.
pub fn reservation_key(message_id: &Uuid) -> String {
    format!("msg:{message_id}")
}

/// A single immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    /// Signed credit change. Reservations are negative, grants positive.
    pub delta: i64,
    pub reason: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// One user's allocation from their company's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreditLimit {
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub remaining_credits: i64,
    pub updated_at: DateTime<Utc>,
}

/// Pool-level view after a reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSnapshot {
    pub pool_balance: i64,
    /// Sum of `remaining_credits` over every limit row of the company.
    pub allocated_total: i64,
    pub unallocated_balance: i64,
}

impl CreditSnapshot {
    pub fn new(pool_balance: i64, allocated_total: i64) -> Self {
        Self {
            pool_balance,
            allocated_total,
            unallocated_balance: pool_balance - allocated_total,
        }
    }
}

/// Result of `apply_user_limit_delta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitAdjustment {
    pub user_id: Uuid,
    pub remaining_credits: i64,
    #[serde(flatten)]
    pub snapshot: CreditSnapshot,
}

/// Result of detaching a user from their company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachOutcome {
    pub user_id: Uuid,
    pub previous_company_id: Uuid,
    pub previous_role: UserRole,
    /// Credits the user still held when their limit row was removed.
    pub released_limit: i64,
}

/// An administrative credit movement into (or out of) a company pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub amount: i64,
    pub reason: String,
    /// Generated when absent.
    pub idempotency_key: Option<String>,
}

/// Pool and membership totals for one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySummary {
    pub company_id: Uuid,
    #[serde(flatten)]
    pub snapshot: CreditSnapshot,
    pub total_users: i64,
    pub active_users: i64,
}
