//! The session map: session id to tenant binding, handler, and liveness
//! clock.

use crate::event_store::{EventStore, StoredEvent};
use crate::handler::SessionHandler;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cortexd_types::{CortexError, CortexResult, Tenant};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Live messages published as they're appended, so an already-open stream
/// doesn't have to poll the event store to see them. Buffered; a lagging
/// subscriber drops old entries, but replay-by-id from the event store
/// makes that harmless on reconnect.
const LIVE_CHANNEL_CAPACITY: usize = 256;

/// One live session: its tenant binding, handler, and activity clock. The
/// event stream id is the session id itself.
pub struct Session {
    /// The session's id, also its stream id in the [`EventStore`].
    pub id: String,
    /// The tenant this session is permanently bound to.
    pub tenant: Tenant,
    /// The per-session RPC handler.
    pub handler: Arc<dyn SessionHandler>,
    /// When this session was created.
    pub created_at: DateTime<Utc>,
    last_active: RwLock<DateTime<Utc>>,
    live_tx: broadcast::Sender<StoredEvent>,
}

impl Session {
    /// Subscribes to this session's live (not-yet-persisted-at-subscribe-time)
    /// message feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.live_tx.subscribe()
    }

    /// Persists `payload` to `store` under this session's stream and
    /// publishes it to any live subscriber. Returns the assigned event id.
    pub async fn emit(&self, store: &dyn EventStore, payload: Value) -> CortexResult<u64> {
        let event_id = store.append(&self.id, payload.clone()).await?;
        let _ = self.live_tx.send(StoredEvent { event_id, payload });
        Ok(event_id)
    }

    async fn touch(&self) {
        *self.last_active.write().await = Utc::now();
    }

    async fn is_expired(&self, ttl: ChronoDuration) -> bool {
        Utc::now() - *self.last_active.read().await > ttl
    }
}

/// The concurrent session map. Insertion on creation is the single writer
/// per session id; lookups by id take only a read lock on the map itself.
pub struct SessionMap {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: ChronoDuration,
}

impl SessionMap {
    /// Builds a map whose sessions expire after `ttl_seconds` of inactivity.
    pub fn new(ttl_seconds: i64) -> Self {
        SessionMap {
            sessions: RwLock::new(HashMap::new()),
            ttl: ChronoDuration::seconds(ttl_seconds),
        }
    }

    /// Creates a new session bound to `tenant`, with a fresh random id.
    pub async fn create(&self, tenant: Tenant, handler: Arc<dyn SessionHandler>) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            id: id.clone(),
            tenant,
            handler,
            created_at: now,
            last_active: RwLock::new(now),
            live_tx,
        });
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    /// Looks up a session by id, refreshing its activity clock. Fails with
    /// [`CortexError::SessionGone`] if the id is unknown or its TTL has
    /// lapsed.
    pub async fn get(&self, id: &str) -> CortexResult<Arc<Session>> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(id).cloned().ok_or(CortexError::SessionGone)?
        };
        if session.is_expired(self.ttl).await {
            self.sessions.write().await.remove(id);
            return Err(CortexError::SessionGone);
        }
        session.touch().await;
        Ok(session)
    }

    /// Removes a session, releasing its state. A no-op if already absent.
    pub async fn remove(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    /// Removes every session whose TTL has lapsed since its last touch.
    /// Callers run this on an interval; `get`'s correctness doesn't depend
    /// on it.
    pub async fn sweep_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.is_expired(self.ttl).await {
                    expired.push(id.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &expired {
                sessions.remove(id);
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl SessionHandler for NoopHandler {
        async fn handle(&self, _request: Value) -> CortexResult<Vec<Value>> {
            Ok(vec![])
        }
    }

    fn tenant() -> Tenant {
        Tenant { user_id: "u1".to_string(), project_id: "p1".to_string() }
    }

    #[tokio::test]
    async fn get_unknown_session_fails() {
        let map = SessionMap::new(86400);
        assert!(matches!(map.get("ghost").await, Err(CortexError::SessionGone)));
    }

    #[tokio::test]
    async fn created_session_is_retrievable() {
        let map = SessionMap::new(86400);
        let session = map.create(tenant(), Arc::new(NoopHandler)).await;
        let found = map.get(&session.id).await.unwrap();
        assert_eq!(found.tenant, tenant());
    }

    #[tokio::test]
    async fn removed_session_is_gone() {
        let map = SessionMap::new(86400);
        let session = map.create(tenant(), Arc::new(NoopHandler)).await;
        map.remove(&session.id).await;
        assert!(matches!(map.get(&session.id).await, Err(CortexError::SessionGone)));
    }

    #[tokio::test]
    async fn expired_session_is_treated_as_gone() {
        let map = SessionMap::new(0);
        let session = map.create(tenant(), Arc::new(NoopHandler)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(matches!(map.get(&session.id).await, Err(CortexError::SessionGone)));
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_sessions_only() {
        let map = SessionMap::new(86400);
        let fresh = map.create(tenant(), Arc::new(NoopHandler)).await;
        drop(fresh);
        assert_eq!(map.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn emit_persists_and_publishes() {
        let map = SessionMap::new(86400);
        let session = map.create(tenant(), Arc::new(NoopHandler)).await;
        let store = InMemoryEventStore::new();
        let mut live = session.subscribe();

        let event_id = session.emit(&store, json!({"hello": "world"})).await.unwrap();
        assert_eq!(event_id, 1);

        let replayed = store.replay_after(&session.id, 0).await.unwrap();
        assert_eq!(replayed.len(), 1);

        let published = live.recv().await.unwrap();
        assert_eq!(published.event_id, 1);
    }
}
