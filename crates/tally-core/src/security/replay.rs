//! Replay guard for signed internal requests.
//!
//! A nonce is accepted once per TTL. The check and the insert happen under a
//! single lock so two requests carrying the same nonce can never both pass.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Atomic check-and-store over recently seen nonces.
///
/// The in-memory implementation is process-local. A deployment with several
/// gateway instances needs a shared store behind this same trait.
pub trait NonceStore: Send + Sync {
    /// Prune expired entries, then record `nonce` until `now + ttl`.
    ///
    /// Returns `true` only if the nonce was not already live.
    fn check_and_store(&self, nonce: &str, now: i64) -> bool;
}

/// `NonceStore` backed by a mutex-guarded map of nonce -> expiry (unix secs).
pub struct InMemoryNonceStore {
    ttl_secs: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl InMemoryNonceStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries (after the last prune).
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonceStore for InMemoryNonceStore {
    fn check_and_store(&self, nonce: &str, now: i64) -> bool {
        // A panic while holding the lock cannot leave the map half-updated.
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, expires_at| *expires_at > now);

        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), now + self.ttl_secs);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_sight_accepted_second_rejected() {
        let store = InMemoryNonceStore::new(300);
        assert!(store.check_and_store("abc", 1_000));
        assert!(!store.check_and_store("abc", 1_001));
        assert!(store.check_and_store("def", 1_001));
    }

    #[test]
    fn test_nonce_reusable_after_expiry() {
        let store = InMemoryNonceStore::new(300);
        assert!(store.check_and_store("abc", 1_000));
        // Still live one second before expiry.
        assert!(!store.check_and_store("abc", 1_299));
        // Expiry <= now prunes the entry.
        assert!(store.check_and_store("abc", 1_300));
    }

    #[test]
    fn test_prunes_only_during_check() {
        let store = InMemoryNonceStore::new(10);
        store.check_and_store("a", 0);
        store.check_and_store("b", 5);
        assert_eq!(store.len(), 2);

        store.check_and_store("c", 12);
        // "a" expired at 10 and was pruned; "b" lives until 15.
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_same_nonce_admits_exactly_one() {
        let store = Arc::new(InMemoryNonceStore::new(300));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.check_and_store("shared", 42))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
