//! Ordered row-lock table for ledger mutations.
//!
//! Every operation that touches a company's ledger or limit rows takes its
//! locks through [`RowLocks::acquire`], which always locks in the order
//! company -> user -> limit regardless of the order the caller lists them.
//! Two operations competing for overlapping rows therefore queue instead of
//! deadlocking.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// A lockable row. Variant order is lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Company(Uuid),
    User(Uuid),
    /// A user's credit limit row, keyed by user id (one row per user).
    Limit(Uuid),
}

/// Guards held for the duration of one ledger transaction.
///
/// Dropping the guard unlocks every row, then removes the table entries that
/// no other task holds or waits on.
#[must_use = "locks are released when the guard is dropped"]
pub struct RowLockGuard<'a> {
    table: &'a DashMap<RowKey, Arc<Mutex<()>>>,
    keys: Vec<RowKey>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl RowLockGuard<'_> {
    /// Keys in the order they were locked.
    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }
}

impl Drop for RowLockGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            // Only the table's own reference left: idle.
            self.table.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

/// Table of per-row async mutexes.
#[derive(Default)]
pub struct RowLocks {
    table: DashMap<RowKey, Arc<Mutex<()>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key, sorted into company -> user -> limit order.
    pub async fn acquire(&self, keys: &[RowKey]) -> RowLockGuard<'_> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in &ordered {
            // Clone the Arc out so no DashMap shard lock is held across the await.
            let mutex = Arc::clone(self.table.entry(*key).or_default().value());
            guards.push(mutex.lock_owned().await);
        }

        RowLockGuard {
            table: &self.table,
            keys: ordered,
            guards,
        }
    }

    /// The usual company -> user -> limit triple.
    pub async fn acquire_user(&self, company_id: Uuid, user_id: Uuid) -> RowLockGuard<'_> {
        self.acquire(&[
            RowKey::Company(company_id),
            RowKey::User(user_id),
            RowKey::Limit(user_id),
        ])
        .await
    }

    /// Rows currently held or waited on.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_sorts_into_lock_order() {
        let locks = RowLocks::new();
        let company = Uuid::now_v7();
        let user = Uuid::now_v7();

        let guard = locks
            .acquire(&[RowKey::Limit(user), RowKey::Company(company), RowKey::User(user)])
            .await;
        assert_eq!(
            guard.keys(),
            &[RowKey::Company(company), RowKey::User(user), RowKey::Limit(user)]
        );
    }

    #[tokio::test]
    async fn test_second_acquirer_waits_for_release() {
        let locks = Arc::new(RowLocks::new());
        let company = Uuid::now_v7();
        let user = Uuid::now_v7();

        let guard = locks.acquire_user(company, user).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire(&[RowKey::Company(company)]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_opposite_listing_orders_do_not_deadlock() {
        let locks = Arc::new(RowLocks::new());
        let company = Uuid::now_v7();
        let user = Uuid::now_v7();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let locks = Arc::clone(&locks);
            tasks.push(tokio::spawn(async move {
                let keys = if i % 2 == 0 {
                    vec![RowKey::Company(company), RowKey::User(user)]
                } else {
                    vec![RowKey::User(user), RowKey::Company(company)]
                };
                let _g = locks.acquire(&keys).await;
                tokio::task::yield_now().await;
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_released_rows_leave_the_table() {
        let locks = RowLocks::new();
        let held = Uuid::now_v7();
        let company = Uuid::now_v7();
        let user = Uuid::now_v7();

        let guard = locks.acquire(&[RowKey::User(held)]).await;
        drop(locks.acquire_user(company, user).await);
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_row_entry_alive() {
        let locks = Arc::new(RowLocks::new());
        let user = Uuid::now_v7();

        let guard = locks.acquire(&[RowKey::User(user)]).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire(&[RowKey::User(user)]).await;
                locks.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        // The waiter still found the row in the table once it got the lock.
        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, 1);
        assert!(locks.is_empty());
    }
}
