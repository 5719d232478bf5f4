//! Credit ledger port.
//!
//! The ledger is the single source of truth for a company's pool balance:
//! the balance is `SUM(delta)` over its rows and is recomputed for every
//! admission decision. Per-user limits are the only mutable credit state.
//!
//! Every mutating operation runs in one store transaction under the locks
//! from [`locks::RowLocks`] and is rolled back in full on rejection.

pub mod locks;

use tally_types::error::CreditError;
use tally_types::ledger::{CompanySummary, CreditGrant, DetachOutcome, LedgerEntry, LimitAdjustment};
use uuid::Uuid;

/// Credit ledger operations.
///
/// Implementations live in tally-infra (e.g., `SqliteCreditLedger`).
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait CreditLedger: Send + Sync {
    /// Debit `units` from the user's limit and the company pool for one
    /// message, keyed `msg:<message_id>`.
    ///
    /// Replaying the same `message_id` returns the existing row unchanged.
    fn reserve_chat_credits(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        message_id: &Uuid,
        units: i64,
    ) -> impl std::future::Future<Output = Result<LedgerEntry, CreditError>> + Send;

    /// Move a user's allocation by `delta`, keeping the sum of active users'
    /// remaining credits within the pool balance.
    fn apply_user_limit_delta(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        delta: i64,
    ) -> impl std::future::Future<Output = Result<LimitAdjustment, CreditError>> + Send;

    /// Remove a user from their company, releasing their allocation and
    /// revoking their sessions. Ledger history is untouched.
    fn detach_user(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<DetachOutcome, CreditError>> + Send;

    /// Append an administrative ledger row. A colliding idempotency key is
    /// reported as [`CreditError::DuplicateKey`] and writes nothing.
    fn grant_credits(
        &self,
        grant: &CreditGrant,
    ) -> impl std::future::Future<Output = Result<LedgerEntry, CreditError>> + Send;

    /// Current `SUM(delta)` for the company.
    fn pool_balance(
        &self,
        company_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<i64, CreditError>> + Send;

    fn company_summary(
        &self,
        company_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<CompanySummary, CreditError>> + Send;

    /// Ledger rows for a company, newest first.
    fn list_entries(
        &self,
        company_id: &Uuid,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<LedgerEntry>, CreditError>> + Send;
}
