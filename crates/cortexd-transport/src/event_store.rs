//! Durable per-stream storage for server→client messages, enabling replay
//! after a dropped connection resumes with a `last-event-id`.

use async_trait::async_trait;
use chrono::Utc;
use cortexd_types::{CortexError, CortexResult};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

fn sql_err(err: sqlx::Error) -> CortexError {
    CortexError::IoError(format!("postgres error: {err}"))
}

/// One message recorded against a stream, in the order it was appended.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Strictly increasing within a stream, starting at 1.
    pub event_id: u64,
    /// The message body as delivered to the client.
    pub payload: Value,
}

/// Append-only per-stream message log. A session's transport writes every
/// server→client message here before it is sent, so a reconnecting client
/// can replay exactly what it missed.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `payload` to `stream_id`'s log, returning its assigned id.
    async fn append(&self, stream_id: &str, payload: Value) -> CortexResult<u64>;

    /// Every event in `stream_id` with id strictly greater than
    /// `last_event_id`, in original order. An unknown stream yields an
    /// empty vec, not an error.
    async fn replay_after(&self, stream_id: &str, last_event_id: u64) -> CortexResult<Vec<StoredEvent>>;

    /// Drops a stream's history, called when its session closes.
    async fn drop_stream(&self, stream_id: &str) -> CortexResult<()>;
}

struct Stream {
    events: Vec<StoredEvent>,
    next_id: u64,
}

impl Default for Stream {
    fn default() -> Self {
        Stream { events: Vec::new(), next_id: 1 }
    }
}

/// An in-process [`EventStore`]. Correct for a single server instance;
/// history does not survive a restart, so a relational-table backend is
/// required wherever replay must outlive the process.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Stream>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream_id: &str, payload: Value) -> CortexResult<u64> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(stream_id.to_string()).or_default();
        let event_id = stream.next_id;
        stream.next_id += 1;
        stream.events.push(StoredEvent { event_id, payload });
        Ok(event_id)
    }

    async fn replay_after(&self, stream_id: &str, last_event_id: u64) -> CortexResult<Vec<StoredEvent>> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|stream| {
                stream
                    .events
                    .iter()
                    .filter(|event| event.event_id > last_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn drop_stream(&self, stream_id: &str) -> CortexResult<()> {
        self.streams.write().await.remove(stream_id);
        Ok(())
    }
}

/// Creates the `rpc_events` table if it doesn't already exist.
pub async fn ensure_rpc_events_schema(pool: &PgPool) -> CortexResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rpc_events (
            stream_id TEXT NOT NULL,
            id BIGINT NOT NULL,
            payload_json JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (stream_id, id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;
    Ok(())
}

/// An [`EventStore`] backed by the `rpc_events` table, so replay survives
/// a server restart. Appends to the same stream are serialized with a
/// per-stream advisory lock, held for the transaction's lifetime, so the
/// next-id computation and the insert can never race.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Wraps an existing pool. Callers are expected to have already run
    /// [`ensure_rpc_events_schema`] once at startup.
    pub fn new(pool: PgPool) -> Self {
        PgEventStore { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, stream_id: &str, payload: Value) -> CortexResult<u64> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(stream_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        let next_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM rpc_events WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sql_err)?;

        sqlx::query(
            "INSERT INTO rpc_events (stream_id, id, payload_json, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(stream_id)
        .bind(next_id)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        tx.commit().await.map_err(sql_err)?;
        Ok(next_id as u64)
    }

    async fn replay_after(&self, stream_id: &str, last_event_id: u64) -> CortexResult<Vec<StoredEvent>> {
        let rows = sqlx::query(
            "SELECT id, payload_json FROM rpc_events WHERE stream_id = $1 AND id > $2 ORDER BY id",
        )
        .bind(stream_id)
        .bind(last_event_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.into_iter()
            .map(|row| {
                let event_id: i64 = row.try_get("id").map_err(sql_err)?;
                let payload: Value = row.try_get("payload_json").map_err(sql_err)?;
                Ok(StoredEvent { event_id: event_id as u64, payload })
            })
            .collect()
    }

    async fn drop_stream(&self, stream_id: &str) -> CortexResult<()> {
        sqlx::query("DELETE FROM rpc_events WHERE stream_id = $1")
            .bind(stream_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_assign_strictly_increasing_ids() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.append("s1", json!({"n": 1})).await.unwrap(), 1);
        assert_eq!(store.append("s1", json!({"n": 2})).await.unwrap(), 2);
        assert_eq!(store.append("s1", json!({"n": 3})).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn replay_after_returns_only_later_events_in_order() {
        let store = InMemoryEventStore::new();
        store.append("s1", json!({"n": 1})).await.unwrap();
        store.append("s1", json!({"n": 2})).await.unwrap();
        store.append("s1", json!({"n": 3})).await.unwrap();

        let replayed = store.replay_after("s1", 1).await.unwrap();
        let ids: Vec<u64> = replayed.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn replay_after_unknown_stream_is_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.replay_after("ghost", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let store = InMemoryEventStore::new();
        store.append("s1", json!({"n": 1})).await.unwrap();
        assert_eq!(store.append("s2", json!({"n": 1})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drop_stream_clears_its_history() {
        let store = InMemoryEventStore::new();
        store.append("s1", json!({"n": 1})).await.unwrap();
        store.drop_stream("s1").await.unwrap();
        assert!(store.replay_after("s1", 0).await.unwrap().is_empty());
        // the stream starts fresh afterwards rather than continuing its old ids.
        assert_eq!(store.append("s1", json!({"n": 1})).await.unwrap(), 1);
    }

    /// Live Postgres integration tests are opt-in: set
    /// `CORTEXD_TEST_DATABASE_URL` to run them, otherwise they no-op so the
    /// suite stays green without a database on hand.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("CORTEXD_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to test database");
        ensure_rpc_events_schema(&pool).await.expect("migrate test schema");
        Some(pool)
    }

    #[tokio::test]
    async fn pg_store_assigns_increasing_ids_and_replays_in_order() {
        let Some(pool) = test_pool().await else { return };
        let store = PgEventStore::new(pool);
        let stream = format!("test-stream-{}", Utc::now().timestamp_nanos_opt().unwrap());

        assert_eq!(store.append(&stream, json!({"n": 1})).await.unwrap(), 1);
        assert_eq!(store.append(&stream, json!({"n": 2})).await.unwrap(), 2);
        assert_eq!(store.append(&stream, json!({"n": 3})).await.unwrap(), 3);

        let replayed = store.replay_after(&stream, 1).await.unwrap();
        let ids: Vec<u64> = replayed.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![2, 3]);

        store.drop_stream(&stream).await.unwrap();
        assert!(store.replay_after(&stream, 0).await.unwrap().is_empty());
    }
}
