#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-auth** – credential hashing, a TTL cache, and a persistent
//! lookup for API keys. A presented credential resolves to an
//! [`AuthContext`] carrying the tenant identity and quota every downstream
//! call is scoped by. Plaintext credentials are never retained past the
//! call that hashes them.

mod cache;
mod store;

pub use cache::AuthContext;
pub use store::{ensure_api_keys_schema, ApiKeyRecord, CredentialStore, PgCredentialStore};

use cortexd_types::{CortexError, CortexResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long a resolved credential is trusted before the persistent store
/// is consulted again.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

fn hash_credential(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

/// Resolves a presented credential to an [`AuthContext`], backed by a TTL
/// cache in front of a [`CredentialStore`].
pub struct AuthGate {
    store: Arc<dyn CredentialStore>,
    cache: RwLock<HashMap<String, (AuthContext, Instant)>>,
    cache_ttl: Duration,
}

impl AuthGate {
    /// Builds a gate over `store` with the default cache TTL (5 minutes).
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self::with_cache_ttl(store, DEFAULT_CACHE_TTL)
    }

    /// As [`AuthGate::new`], with an explicit cache TTL.
    pub fn with_cache_ttl(store: Arc<dyn CredentialStore>, cache_ttl: Duration) -> Self {
        AuthGate {
            store,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Resolves `credential` to its [`AuthContext`]. Fails with
    /// [`CortexError::TenantDenied`] if the credential is empty, unknown,
    /// revoked, or expired. On a cache hit, a last-seen update is still
    /// fired off in the background — cache freshness shouldn't starve the
    /// audit trail.
    pub async fn authenticate(&self, credential: &str) -> CortexResult<AuthContext> {
        if credential.is_empty() {
            return Err(CortexError::TenantDenied);
        }
        let hash = hash_credential(credential);

        if let Some(ctx) = self.cached(&hash).await {
            self.touch_last_seen(hash);
            return Ok(ctx);
        }

        let record = self
            .store
            .lookup(&hash)
            .await?
            .ok_or(CortexError::TenantDenied)?;
        if record.revoked_at.is_some() {
            return Err(CortexError::TenantDenied);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= chrono::Utc::now() {
                return Err(CortexError::TenantDenied);
            }
        }

        let ctx = AuthContext {
            user_id: record.user_id,
            project_id: record.project_id,
            scopes: record.scopes,
            rate_limit: record.rate_limit,
        };
        self.cache
            .write()
            .await
            .insert(hash.clone(), (ctx.clone(), Instant::now()));
        self.touch_last_seen(hash);
        Ok(ctx)
    }

    async fn cached(&self, hash: &str) -> Option<AuthContext> {
        let cache = self.cache.read().await;
        let (ctx, inserted_at) = cache.get(hash)?;
        if inserted_at.elapsed() < self.cache_ttl {
            Some(ctx.clone())
        } else {
            None
        }
    }

    fn touch_last_seen(&self, hash: String) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.touch_last_seen(&hash).await {
                tracing::warn!(error = %err, "failed to update api key last-seen timestamp");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        records: HashMap<String, ApiKeyRecord>,
        touched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CredentialStore for FakeStore {
        async fn lookup(&self, key_hash: &str) -> CortexResult<Option<ApiKeyRecord>> {
            Ok(self.records.get(key_hash).cloned())
        }

        async fn touch_last_seen(&self, key_hash: &str) -> CortexResult<()> {
            self.touched.lock().unwrap().push(key_hash.to_string());
            Ok(())
        }
    }

    fn record() -> ApiKeyRecord {
        ApiKeyRecord {
            user_id: "user-1".to_string(),
            project_id: "proj-1".to_string(),
            scopes: vec!["read".to_string()],
            rate_limit: 60,
            revoked_at: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn rejects_empty_credential() {
        let store = Arc::new(FakeStore {
            records: HashMap::new(),
            touched: Mutex::new(Vec::new()),
        });
        let gate = AuthGate::new(store);
        assert!(matches!(gate.authenticate("").await, Err(CortexError::TenantDenied)));
    }

    #[tokio::test]
    async fn rejects_unknown_credential() {
        let store = Arc::new(FakeStore {
            records: HashMap::new(),
            touched: Mutex::new(Vec::new()),
        });
        let gate = AuthGate::new(store);
        assert!(matches!(
            gate.authenticate("live_unknown").await,
            Err(CortexError::TenantDenied)
        ));
    }

    #[tokio::test]
    async fn resolves_known_credential_and_caches_it() {
        let hash = hash_credential("live_abc123");
        let mut records = HashMap::new();
        records.insert(hash, record());
        let store = Arc::new(FakeStore {
            records,
            touched: Mutex::new(Vec::new()),
        });
        let gate = AuthGate::new(store.clone());

        let ctx = gate.authenticate("live_abc123").await.unwrap();
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.project_id, "proj-1");

        // Second call should hit the cache rather than the store; both
        // paths still produce the same context.
        let ctx_again = gate.authenticate("live_abc123").await.unwrap();
        assert_eq!(ctx, ctx_again);
    }

    #[tokio::test]
    async fn rejects_revoked_credential() {
        let hash = hash_credential("live_revoked");
        let mut rec = record();
        rec.revoked_at = Some(chrono::Utc::now());
        let mut records = HashMap::new();
        records.insert(hash, rec);
        let store = Arc::new(FakeStore {
            records,
            touched: Mutex::new(Vec::new()),
        });
        let gate = AuthGate::new(store);
        assert!(matches!(
            gate.authenticate("live_revoked").await,
            Err(CortexError::TenantDenied)
        ));
    }

    #[tokio::test]
    async fn rejects_expired_credential() {
        let hash = hash_credential("live_expired");
        let mut rec = record();
        rec.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let mut records = HashMap::new();
        records.insert(hash, rec);
        let store = Arc::new(FakeStore {
            records,
            touched: Mutex::new(Vec::new()),
        });
        let gate = AuthGate::new(store);
        assert!(matches!(
            gate.authenticate("live_expired").await,
            Err(CortexError::TenantDenied)
        ));
    }
}
