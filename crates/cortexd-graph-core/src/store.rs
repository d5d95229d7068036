//! The abstract contracts both backends satisfy: [`EventLog`] for raw
//! append/read access, and [`GraphStore`] for the higher-level graph
//! operations built on top of it.

use crate::cache::Generation;
use crate::search::{SearchOptions, SearchResults};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_types::{
    CortexResult, Entity, EntityId, GraphEvent, Observation, ObservationId, ObservationSource,
    Relation,
};
use serde_json::Value;
use std::collections::HashMap;

/// Resolves an entity either by its stable id or by name (normalized at
/// resolution time), as `addObservation`/`linkEntities`/`deleteEntity`
/// allow.
#[derive(Debug, Clone)]
pub enum EntityRef {
    /// Resolve by stable id.
    Id(EntityId),
    /// Resolve by name, normalized before lookup.
    Name(String),
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        EntityRef::Id(id)
    }
}

impl From<&str> for EntityRef {
    fn from(name: &str) -> Self {
        EntityRef::Name(name.to_string())
    }
}

/// Before/after byte counts of a [`GraphStore::compact`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Log size before compaction.
    pub before_bytes: u64,
    /// Log size after compaction.
    pub after_bytes: u64,
}

/// The append-only log contract. Implementations guarantee: event 0 is
/// always a valid marker; append is atomic; a failed append never corrupts
/// an existing valid log; readers tolerate a partially-written tail.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends one event. Either it becomes fully visible or the log is
    /// left exactly as it was.
    async fn append(&self, event: GraphEvent) -> CortexResult<()>;
    /// Reads every record in insertion order.
    async fn read_all(&self) -> CortexResult<Vec<GraphEvent>>;
    /// For compaction only — atomically replaces the whole log.
    async fn truncate_and_replace(&self, events: Vec<GraphEvent>) -> CortexResult<()>;
    /// The log's current opaque freshness tag.
    async fn generation(&self) -> CortexResult<Generation>;
}

/// The abstract contract both `FileBackend` and `RelationalBackend`
/// satisfy. Every method that can fail returns a [`cortexd_types::CortexError`]
/// whose `kind()` is one of the result-variant kinds from the error
/// taxonomy.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Creates or validates the store's marker and builds the initial
    /// snapshot.
    async fn initialize(&self) -> CortexResult<()>;

    /// Inserts or replaces the entity identified by `(normalize(name),
    /// entity_type)`.
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attrs: HashMap<String, Value>,
    ) -> CortexResult<Entity>;

    /// Attaches a free-text fact to an entity, resolved by id or by name.
    async fn add_observation(
        &self,
        entity_ref: EntityRef,
        text: &str,
        source: ObservationSource,
        timestamp: Option<DateTime<Utc>>,
    ) -> CortexResult<Observation>;

    /// Idempotent: returns the existing relation if `(from, type, to)` is
    /// already present.
    async fn link_entities(
        &self,
        from: EntityRef,
        relation_type: &str,
        to: EntityRef,
    ) -> CortexResult<Relation>;

    /// Idempotent: a no-op if the relation is already absent.
    async fn unlink_entities(
        &self,
        from: EntityRef,
        relation_type: &str,
        to: EntityRef,
    ) -> CortexResult<()>;

    /// Cascades to the entity's observations and incident relations in the
    /// reducer, as a single log event.
    async fn delete_entity(&self, entity_ref: EntityRef) -> CortexResult<()>;

    /// Deletes a single observation by id.
    async fn delete_observation(&self, id: &ObservationId) -> CortexResult<()>;

    /// Scored entity/observation/relation lookup.
    async fn search(&self, query: &str, opts: SearchOptions) -> CortexResult<SearchResults>;

    /// 1–2 hop neighborhood expansion from a seed set.
    async fn expand(
        &self,
        seeds: &[EntityId],
        depth: u8,
    ) -> CortexResult<(Vec<Entity>, Vec<Relation>)>;

    /// Rebuilds iff the log's generation tag has moved since the last
    /// cached snapshot.
    async fn snapshot(&self) -> CortexResult<cortexd_types::Snapshot>;

    /// Unconditional rebuild, writing the snapshot/index/markdown views.
    async fn rebuild(&self) -> CortexResult<cortexd_types::Snapshot>;

    /// Rewrites the log as the minimal equivalent sequence.
    async fn compact(&self) -> CortexResult<CompactionReport>;
}
