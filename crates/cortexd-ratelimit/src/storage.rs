//! Counter storage for [`crate::RateLimiter`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_types::CortexResult;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Bucket {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// An atomic, expiring counter keyed by an opaque identity string. The
/// first increment of a window sets its expiry; increments after expiry
/// start a fresh window rather than accumulating.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`'s counter, returning the count after the
    /// increment. If the key's window has expired (or it's unseen),
    /// starts a new window of `window_seconds` first.
    async fn increment(&self, key: &str, window_seconds: u64) -> CortexResult<u64>;

    /// Drops tracking for `key`, used by admin reset operations.
    async fn reset(&self, key: &str) -> CortexResult<()>;
}

/// An in-process [`CounterStore`]. Suitable for a single server instance;
/// counters are lost on restart and not shared across replicas.
#[derive(Default)]
pub struct InMemoryCounterStore {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl InMemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every bucket whose window has already expired. Callers may
    /// run this periodically to bound memory; correctness doesn't depend
    /// on it, since `increment` treats an expired bucket as absent.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.expires_at > now);
        before - buckets.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window_seconds: u64) -> CortexResult<u64> {
        let now = Utc::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.get_mut(key);
        match bucket {
            Some(bucket) if bucket.expires_at > now => {
                bucket.count += 1;
                Ok(bucket.count)
            }
            _ => {
                let expires_at = now + chrono::Duration::seconds(window_seconds as i64);
                buckets.insert(key.to_string(), Bucket { count: 1, expires_at });
                Ok(1)
            }
        }
    }

    async fn reset(&self, key: &str) -> CortexResult<()> {
        self.buckets.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_within_window() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.increment("a", 60).await.unwrap(), 1);
        assert_eq!(store.increment("a", 60).await.unwrap(), 2);
        assert_eq!(store.increment("a", 60).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn independent_keys_track_separately() {
        let store = InMemoryCounterStore::new();
        store.increment("a", 60).await.unwrap();
        store.increment("a", 60).await.unwrap();
        assert_eq!(store.increment("b", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_window_restarts_count() {
        let store = InMemoryCounterStore::new();
        store.increment("a", 0).await.unwrap();
        // window_seconds = 0 means the bucket is already expired by the
        // time the next call checks it.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.increment("a", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_drops_the_bucket() {
        let store = InMemoryCounterStore::new();
        store.increment("a", 60).await.unwrap();
        store.reset("a").await.unwrap();
        assert_eq!(store.increment("a", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_expired_buckets() {
        let store = InMemoryCounterStore::new();
        store.increment("expired", 0).await.unwrap();
        store.increment("fresh", 60).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = store.cleanup_expired().await;
        assert_eq!(removed, 1);
    }
}
