#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-ratelimit** – per-identity sliding-window rate limiting.
//!
//! [`RateLimiter::check`] enforces a `max` per `window_seconds` bucket
//! against a [`CounterStore`]; callers run it once per dimension (user,
//! IP) they want to enforce in parallel, since either may reject. If the
//! counter store is unreachable the limiter degrades open — the request
//! is allowed and a warning is logged — because availability matters more
//! than strict enforcement here.

mod storage;

pub use storage::{CounterStore, InMemoryCounterStore};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Identifies who or what a rate limit bucket is keyed on.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitKey {
    /// Keyed on an authenticated user id.
    UserId(String),
    /// Keyed on a client IP address.
    IpAddress(IpAddr),
}

impl RateLimitKey {
    /// The string key this identity maps to in the counter store.
    pub fn to_storage_key(&self) -> String {
        match self {
            RateLimitKey::UserId(id) => format!("user:{id}"),
            RateLimitKey::IpAddress(ip) => format!("ip:{ip}"),
        }
    }
}

/// The outcome of a [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The window's ceiling this decision was checked against.
    pub limit: u32,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_in_seconds: u64,
}

/// Enforces sliding-window limits over a [`CounterStore`].
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Builds a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        RateLimiter { store }
    }

    /// Checks and increments `key`'s window. Never returns an error —
    /// a counter store failure degrades to an allowed decision.
    pub async fn check(&self, key: &RateLimitKey, max: u32, window_seconds: u64) -> RateLimitDecision {
        let storage_key = key.to_storage_key();
        match self.store.increment(&storage_key, window_seconds).await {
            Ok(count) if count <= max as u64 => RateLimitDecision {
                allowed: true,
                limit: max,
                remaining: (max as u64 - count) as u32,
                reset_in_seconds: window_seconds,
            },
            Ok(_) => RateLimitDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                reset_in_seconds: window_seconds,
            },
            Err(err) => {
                tracing::warn!(key = %storage_key, error = %err, "rate limit counter store unavailable, degrading open");
                RateLimitDecision {
                    allowed: true,
                    limit: max,
                    remaining: max,
                    reset_in_seconds: window_seconds,
                }
            }
        }
    }

    /// Checks a user key and an IP key against their own limits; either
    /// rejecting rejects the request. Both checks always run, so both
    /// windows advance regardless of which one (if either) is over.
    pub async fn check_both(
        &self,
        user_key: &RateLimitKey,
        ip_key: &RateLimitKey,
        user_max: u32,
        ip_max: u32,
        window_seconds: u64,
    ) -> RateLimitDecision {
        let user_decision = self.check(user_key, user_max, window_seconds).await;
        let ip_decision = self.check(ip_key, ip_max, window_seconds).await;
        if !user_decision.allowed {
            user_decision
        } else if !ip_decision.allowed {
            ip_decision
        } else {
            user_decision
        }
    }

    /// Clears `key`'s window, an administrative override.
    pub async fn reset(&self, key: &RateLimitKey) {
        if let Err(err) = self.store.reset(&key.to_storage_key()).await {
            tracing::warn!(key = %key.to_storage_key(), error = %err, "failed to reset rate limit bucket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortexd_types::{CortexError, CortexResult};

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str, _window_seconds: u64) -> CortexResult<u64> {
            Err(CortexError::IoError("counter store unreachable".to_string()))
        }
        async fn reset(&self, _key: &str) -> CortexResult<()> {
            Err(CortexError::IoError("counter store unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn allows_requests_within_the_limit() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
        let key = RateLimitKey::UserId("alice".to_string());
        for expected_remaining in (0..3).rev() {
            let decision = limiter.check(&key, 3, 60).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
    }

    #[tokio::test]
    async fn rejects_once_the_limit_is_exceeded() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
        let key = RateLimitKey::UserId("bob".to_string());
        limiter.check(&key, 1, 60).await;
        let decision = limiter.check(&key, 1, 60).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn degrades_open_when_the_store_is_unavailable() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let key = RateLimitKey::UserId("carol".to_string());
        let decision = limiter.check(&key, 5, 60).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn check_both_rejects_if_either_dimension_is_over() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
        let user_key = RateLimitKey::UserId("dave".to_string());
        let ip_key = RateLimitKey::IpAddress("10.0.0.1".parse().unwrap());

        // Exhaust only the IP bucket.
        limiter.check(&ip_key, 1, 60).await;

        let decision = limiter.check_both(&user_key, &ip_key, 100, 1, 60).await;
        assert!(!decision.allowed);
    }
}
