//! Sliding-window rate limiting.
//!
//! Each key keeps the instants of its recent admissions. A request is
//! admitted when fewer than `max_requests` admissions fall inside the last
//! `window`; rejected requests are not recorded.
//!
//! [`CompositeRateLimiter`] checks company, user and client IP in that order
//! and stops at the first dimension that rejects. Quota consumed by the
//! dimensions checked before the rejecting one stays consumed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tally_types::config::RateLimitConfig;
use tally_types::error::{RateDimension, RateLimitError};
use uuid::Uuid;

/// Storage for per-key admission windows.
///
/// `admit` must prune, count and record as one atomic step for a given key.
pub trait WindowStore: Send + Sync {
    fn admit(&self, key: &str, now: Instant, window: Duration, max_requests: usize) -> bool;
}

/// Process-local `WindowStore`.
///
/// The `DashMap` entry guard serializes concurrent callers on the same key.
/// At most once per window length, keys whose newest admission has left the
/// window are dropped.
#[derive(Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, VecDeque<Instant>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently tracked.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn sweep_expired(&self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now.saturating_duration_since(at) < window) {
                return;
            }
            *last = Some(now);
        }
        self.windows
            .retain(|_, hits| hits.back().is_some_and(|t| *t >= cutoff));
    }
}

impl WindowStore for InMemoryWindowStore {
    fn admit(&self, key: &str, now: Instant, window: Duration, max_requests: usize) -> bool {
        let admitted = {
            let mut hits = self.windows.entry(key.to_string()).or_default();

            if let Some(cutoff) = now.checked_sub(window) {
                while hits.front().is_some_and(|t| *t < cutoff) {
                    hits.pop_front();
                }
            }

            if hits.len() >= max_requests {
                false
            } else {
                hits.push_back(now);
                true
            }
        };

        // The entry guard is gone; `retain` would deadlock on its shard.
        self.sweep_expired(now, window);
        admitted
    }
}

/// One dimension's limiter: `max_requests` per `window`.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self::with_store(Arc::new(InMemoryWindowStore::new()), max_requests, window)
    }

    pub fn with_store(store: Arc<dyn WindowStore>, max_requests: usize, window: Duration) -> Self {
        Self {
            store,
            max_requests,
            window,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        self.store.admit(key, now, self.window, self.max_requests)
    }
}

/// The three independent limiters a chat request passes through.
#[derive(Clone)]
pub struct CompositeRateLimiter {
    company: SlidingWindowLimiter,
    user: SlidingWindowLimiter,
    ip: SlidingWindowLimiter,
}

impl CompositeRateLimiter {
    pub fn new(company: SlidingWindowLimiter, user: SlidingWindowLimiter, ip: SlidingWindowLimiter) -> Self {
        Self { company, user, ip }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let window = Duration::from_secs(config.window_secs);
        Self::new(
            SlidingWindowLimiter::new(config.company_per_window, window),
            SlidingWindowLimiter::new(config.user_per_window, window),
            SlidingWindowLimiter::new(config.ip_per_window, window),
        )
    }

    pub fn check(
        &self,
        company_id: Option<&Uuid>,
        user_id: &Uuid,
        client_ip: Option<&str>,
    ) -> Result<(), RateLimitError> {
        self.check_at(company_id, user_id, client_ip, Instant::now())
    }

    /// Company, then user, then IP. Absent dimensions are skipped.
    pub fn check_at(
        &self,
        company_id: Option<&Uuid>,
        user_id: &Uuid,
        client_ip: Option<&str>,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        if let Some(company_id) = company_id {
            if !self.company.allow_at(&format!("company:{company_id}"), now) {
                return Err(RateLimitError::Exceeded(RateDimension::Company));
            }
        }
        if !self.user.allow_at(&format!("user:{user_id}"), now) {
            return Err(RateLimitError::Exceeded(RateDimension::User));
        }
        if let Some(ip) = client_ip {
            if !self.ip.allow_at(&format!("ip:{ip}"), now) {
                return Err(RateLimitError::Exceeded(RateDimension::Ip));
            }
        }
        Ok(())
    }
}
