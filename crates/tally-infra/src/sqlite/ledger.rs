//! SQLite credit ledger.
//!
//! Implements `CreditLedger` from `tally-core`. Each mutating operation:
//!
//! 1. takes the row locks (company -> user -> limit) from the shared
//!    [`RowLocks`] table,
//! 2. opens one transaction on the writer pool,
//! 3. re-reads every value it decides on inside that transaction, pool
//!    balance included (always `SUM(delta)`, never a stored number),
//! 4. commits, or drops the transaction so SQLite rolls it back.
//!
//! The `*_in_tx` functions are shared with `SqliteChatRepository`, which
//! bills a turn inside the same transaction that inserts its messages.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tally_core::ledger::CreditLedger;
use tally_core::ledger::locks::{RowKey, RowLocks};
use tally_types::error::CreditError;
use tally_types::identity::UserRole;
use tally_types::ledger::{
    CompanySummary, CreditGrant, CreditSnapshot, DetachOutcome, LedgerEntry, LimitAdjustment,
    REASON_CHAT_MESSAGE, reservation_key,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, is_unique_violation, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `CreditLedger`.
pub struct SqliteCreditLedger {
    pool: DatabasePool,
    locks: Arc<RowLocks>,
}

impl SqliteCreditLedger {
    /// `locks` must be the same table every other ledger writer uses.
    pub fn new(pool: DatabasePool, locks: Arc<RowLocks>) -> Self {
        Self { pool, locks }
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, CreditError> {
        self.pool.writer.begin().await.map_err(storage)
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct LedgerRow {
    id: String,
    company_id: String,
    user_id: Option<String>,
    message_id: Option<String>,
    delta: i64,
    reason: String,
    idempotency_key: String,
    created_at: String,
}

impl LedgerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            user_id: row.try_get("user_id")?,
            message_id: row.try_get("message_id")?,
            delta: row.try_get("delta")?,
            reason: row.try_get("reason")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, CreditError> {
        let optional = |v: Option<String>, what: &str| v.as_deref().map(|s| parse_uuid(s, what)).transpose();
        Ok(LedgerEntry {
            id: parse_uuid(&self.id, "ledger id")?,
            company_id: parse_uuid(&self.company_id, "company_id")?,
            user_id: optional(self.user_id, "user_id")?,
            message_id: optional(self.message_id, "message_id")?,
            delta: self.delta,
            reason: self.reason,
            idempotency_key: self.idempotency_key,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage(e: sqlx::Error) -> CreditError {
    CreditError::Storage(e.to_string())
}

async fn company_exists(conn: &mut SqliteConnection, company_id: &Uuid) -> Result<bool, CreditError> {
    let row = sqlx::query("SELECT 1 FROM companies WHERE id = ?")
        .bind(company_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(row.is_some())
}

/// `(role, is_active, is_superadmin)` for a user that belongs to the company.
async fn company_member(
    conn: &mut SqliteConnection,
    company_id: &Uuid,
    user_id: &Uuid,
) -> Result<Option<(UserRole, bool, bool)>, CreditError> {
    let row = sqlx::query("SELECT role, is_active, is_superadmin FROM users WHERE id = ? AND company_id = ?")
        .bind(user_id.to_string())
        .bind(company_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;

    let Some(row) = row else {
        return Ok(None);
    };
    let role: String = row.try_get("role").map_err(storage)?;
    let role = role.parse().map_err(CreditError::Storage)?;
    Ok(Some((
        role,
        row.try_get("is_active").map_err(storage)?,
        row.try_get("is_superadmin").map_err(storage)?,
    )))
}

async fn remaining_credits(
    conn: &mut SqliteConnection,
    company_id: &Uuid,
    user_id: &Uuid,
) -> Result<Option<i64>, CreditError> {
    let row = sqlx::query("SELECT remaining_credits FROM user_credit_limits WHERE user_id = ? AND company_id = ?")
        .bind(user_id.to_string())
        .bind(company_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    row.map(|r| r.try_get("remaining_credits")).transpose().map_err(storage)
}

pub(crate) async fn pool_balance_in(conn: &mut SqliteConnection, company_id: &Uuid) -> Result<i64, CreditError> {
    let row = sqlx::query("SELECT COALESCE(SUM(delta), 0) AS balance FROM ledger WHERE company_id = ?")
        .bind(company_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage)?;
    row.try_get("balance").map_err(storage)
}

/// Sum of `remaining_credits` over active members of the company.
async fn active_allocated(conn: &mut SqliteConnection, company_id: &Uuid) -> Result<i64, CreditError> {
    let row = sqlx::query(
        r#"SELECT COALESCE(SUM(l.remaining_credits), 0) AS allocated
           FROM user_credit_limits l
           JOIN users u ON u.id = l.user_id
           WHERE l.company_id = ? AND u.company_id = l.company_id AND u.is_active = 1"#,
    )
    .bind(company_id.to_string())
    .fetch_one(&mut *conn)
    .await
    .map_err(storage)?;
    row.try_get("allocated").map_err(storage)
}

/// Sum of `remaining_credits` over every limit row of the company.
async fn allocated_total(conn: &mut SqliteConnection, company_id: &Uuid) -> Result<i64, CreditError> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(remaining_credits), 0) AS allocated FROM user_credit_limits WHERE company_id = ?",
    )
    .bind(company_id.to_string())
    .fetch_one(&mut *conn)
    .await
    .map_err(storage)?;
    row.try_get("allocated").map_err(storage)
}

async fn entry_by_key(conn: &mut SqliteConnection, key: &str) -> Result<Option<LedgerEntry>, CreditError> {
    let row = sqlx::query("SELECT * FROM ledger WHERE idempotency_key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    match row {
        Some(row) => Ok(Some(LedgerRow::from_row(&row).map_err(storage)?.into_entry()?)),
        None => Ok(None),
    }
}

/// Append one ledger row. A colliding key is `DuplicateKey`; the caller must
/// then discard its transaction.
async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<(), CreditError> {
    sqlx::query(
        r#"INSERT INTO ledger (id, company_id, user_id, message_id, delta, reason, idempotency_key, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(entry.id.to_string())
    .bind(entry.company_id.to_string())
    .bind(entry.user_id.map(|u| u.to_string()))
    .bind(entry.message_id.map(|m| m.to_string()))
    .bind(entry.delta)
    .bind(&entry.reason)
    .bind(&entry.idempotency_key)
    .bind(format_datetime(&entry.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CreditError::DuplicateKey(entry.idempotency_key.clone())
        } else {
            storage(e)
        }
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Transactional building blocks (caller holds the row locks)
// ---------------------------------------------------------------------------

/// Reserve `units` for `message_id` on an open transaction.
///
/// An existing reservation for the same message is returned as-is.
pub(crate) async fn reserve_in_tx(
    conn: &mut SqliteConnection,
    company_id: &Uuid,
    user_id: &Uuid,
    message_id: &Uuid,
    units: i64,
) -> Result<LedgerEntry, CreditError> {
    if units <= 0 {
        return Err(CreditError::InvalidUnits(units));
    }

    let key = reservation_key(message_id);
    if let Some(existing) = entry_by_key(conn, &key).await? {
        return Ok(existing);
    }

    if !company_exists(conn, company_id).await? {
        return Err(CreditError::CompanyCreditsInsufficient);
    }
    if company_member(conn, company_id, user_id).await?.is_none() {
        return Err(CreditError::UserCreditsInsufficient);
    }

    let remaining = remaining_credits(conn, company_id, user_id)
        .await?
        .ok_or(CreditError::UserCreditsInsufficient)?;
    if remaining < units {
        return Err(CreditError::UserCreditsInsufficient);
    }

    let balance = pool_balance_in(conn, company_id).await?;
    if balance < units {
        return Err(CreditError::CompanyCreditsInsufficient);
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE user_credit_limits SET remaining_credits = remaining_credits - ?, updated_at = ? WHERE user_id = ?",
    )
    .bind(units)
    .bind(format_datetime(&now))
    .bind(user_id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(storage)?;

    let entry = LedgerEntry {
        id: Uuid::now_v7(),
        company_id: *company_id,
        user_id: Some(*user_id),
        message_id: Some(*message_id),
        delta: -units,
        reason: REASON_CHAT_MESSAGE.to_string(),
        idempotency_key: key,
        created_at: now,
    };
    insert_entry(conn, &entry).await?;
    Ok(entry)
}

// ---------------------------------------------------------------------------
// CreditLedger implementation
// ---------------------------------------------------------------------------

impl CreditLedger for SqliteCreditLedger {
    async fn reserve_chat_credits(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        message_id: &Uuid,
        units: i64,
    ) -> Result<LedgerEntry, CreditError> {
        let _locks = self.locks.acquire_user(*company_id, *user_id).await;
        let mut tx = self.begin().await?;

        match reserve_in_tx(&mut tx, company_id, user_id, message_id, units).await {
            Ok(entry) => {
                tx.commit().await.map_err(storage)?;
                Ok(entry)
            }
            Err(CreditError::DuplicateKey(key)) => {
                // Roll back the decrement, then hand back the row that won.
                tx.rollback().await.map_err(storage)?;
                let mut conn = self.pool.writer.acquire().await.map_err(storage)?;
                entry_by_key(&mut conn, &key)
                    .await?
                    .ok_or(CreditError::DuplicateKey(key))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_user_limit_delta(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        delta: i64,
    ) -> Result<LimitAdjustment, CreditError> {
        let _locks = self.locks.acquire_user(*company_id, *user_id).await;
        let mut tx = self.begin().await?;

        if !company_exists(&mut tx, company_id).await? {
            return Err(CreditError::CompanyNotFound(*company_id));
        }
        let (_, is_active, _) = company_member(&mut tx, company_id, user_id)
            .await?
            .ok_or(CreditError::UserNotFound(*user_id))?;

        let now = format_datetime(&Utc::now());
        let current = match remaining_credits(&mut tx, company_id, user_id).await? {
            Some(current) => current,
            None => {
                sqlx::query(
                    r#"INSERT INTO user_credit_limits (id, company_id, user_id, remaining_credits, updated_at)
                       VALUES (?, ?, ?, 0, ?)"#,
                )
                .bind(Uuid::now_v7().to_string())
                .bind(company_id.to_string())
                .bind(user_id.to_string())
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
                0
            }
        };

        let next = current + delta;
        if next < 0 {
            return Err(CreditError::NegativeLimit(next));
        }

        let pool_balance = pool_balance_in(&mut tx, company_id).await?;
        let allocated = active_allocated(&mut tx, company_id).await?;
        let proposed = if is_active { allocated + delta } else { allocated };
        if delta > 0 && proposed > pool_balance {
            return Err(CreditError::ExceedsPool {
                allocated: proposed,
                pool_balance,
            });
        }

        sqlx::query("UPDATE user_credit_limits SET remaining_credits = ?, updated_at = ? WHERE user_id = ?")
            .bind(next)
            .bind(&now)
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let total = allocated_total(&mut tx, company_id).await?;
        tx.commit().await.map_err(storage)?;

        info!(company_id = %company_id, user_id = %user_id, delta, remaining = next, "user limit adjusted");
        Ok(LimitAdjustment {
            user_id: *user_id,
            remaining_credits: next,
            snapshot: CreditSnapshot::new(pool_balance, total),
        })
    }

    async fn detach_user(&self, company_id: &Uuid, user_id: &Uuid) -> Result<DetachOutcome, CreditError> {
        let _locks = self.locks.acquire_user(*company_id, *user_id).await;
        let mut tx = self.begin().await?;

        let (role, _, is_superadmin) = company_member(&mut tx, company_id, user_id)
            .await?
            .ok_or(CreditError::UserNotFound(*user_id))?;
        if is_superadmin || role == UserRole::Owner {
            return Err(CreditError::ProtectedUser(*user_id));
        }

        let released = remaining_credits(&mut tx, company_id, user_id).await?.unwrap_or(0);
        sqlx::query("DELETE FROM user_credit_limits WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        sqlx::query(
            r#"UPDATE users
               SET company_id = NULL, role = 'member', is_active = 0, joined_company_at = NULL
               WHERE id = ?"#,
        )
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let revoked = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?
            .rows_affected();

        tx.commit().await.map_err(storage)?;

        info!(
            company_id = %company_id,
            user_id = %user_id,
            released_limit = released,
            sessions_revoked = revoked,
            "user detached"
        );
        Ok(DetachOutcome {
            user_id: *user_id,
            previous_company_id: *company_id,
            previous_role: role,
            released_limit: released,
        })
    }

    async fn grant_credits(&self, grant: &CreditGrant) -> Result<LedgerEntry, CreditError> {
        if grant.amount == 0 {
            return Err(CreditError::InvalidUnits(0));
        }

        let mut keys = vec![RowKey::Company(grant.company_id)];
        if let Some(user_id) = grant.user_id {
            keys.push(RowKey::User(user_id));
        }
        let _locks = self.locks.acquire(&keys).await;
        let mut tx = self.begin().await?;

        if !company_exists(&mut tx, &grant.company_id).await? {
            return Err(CreditError::CompanyNotFound(grant.company_id));
        }
        if let Some(user_id) = grant.user_id {
            if company_member(&mut tx, &grant.company_id, &user_id).await?.is_none() {
                return Err(CreditError::UserNotFound(user_id));
            }
        }

        if grant.amount < 0 {
            // A debit may not leave active allocations uncovered.
            let balance = pool_balance_in(&mut tx, &grant.company_id).await?;
            let allocated = active_allocated(&mut tx, &grant.company_id).await?;
            if balance + grant.amount < allocated {
                return Err(CreditError::ExceedsPool {
                    allocated,
                    pool_balance: balance + grant.amount,
                });
            }
        }

        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            company_id: grant.company_id,
            user_id: grant.user_id,
            message_id: None,
            delta: grant.amount,
            reason: grant.reason.clone(),
            idempotency_key: grant
                .idempotency_key
                .clone()
                .unwrap_or_else(|| format!("grant:{}", Uuid::now_v7())),
            created_at: Utc::now(),
        };

        if let Err(e) = insert_entry(&mut tx, &entry).await {
            warn!(key = %entry.idempotency_key, error = %e, "credit grant rejected");
            return Err(e);
        }
        tx.commit().await.map_err(storage)?;

        info!(company_id = %grant.company_id, amount = grant.amount, key = %entry.idempotency_key, "credits granted");
        Ok(entry)
    }

    async fn pool_balance(&self, company_id: &Uuid) -> Result<i64, CreditError> {
        let mut conn = self.pool.reader.acquire().await.map_err(storage)?;
        pool_balance_in(&mut conn, company_id).await
    }

    async fn company_summary(&self, company_id: &Uuid) -> Result<CompanySummary, CreditError> {
        let mut conn = self.pool.reader.acquire().await.map_err(storage)?;
        if !company_exists(&mut conn, company_id).await? {
            return Err(CreditError::CompanyNotFound(*company_id));
        }

        let pool_balance = pool_balance_in(&mut conn, company_id).await?;
        let allocated = allocated_total(&mut conn, company_id).await?;

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS total, COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0) AS active
               FROM users WHERE company_id = ?"#,
        )
        .bind(company_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(storage)?;

        Ok(CompanySummary {
            company_id: *company_id,
            snapshot: CreditSnapshot::new(pool_balance, allocated),
            total_users: row.try_get("total").map_err(storage)?,
            active_users: row.try_get("active").map_err(storage)?,
        })
    }

    async fn list_entries(&self, company_id: &Uuid, limit: i64) -> Result<Vec<LedgerEntry>, CreditError> {
        let rows = sqlx::query("SELECT * FROM ledger WHERE company_id = ? ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(company_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(storage)?;

        rows.iter()
            .map(|row| LedgerRow::from_row(row).map_err(storage)?.into_entry())
            .collect()
    }
}
