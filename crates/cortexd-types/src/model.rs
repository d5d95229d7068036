//! The graph data model: entities, observations, relations, the event log's
//! wire variants, and the materialized snapshot/index derived from them.

use crate::id::{normalize, EntityId, ObservationId, RelationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum nesting depth accepted for an entity's `attrs` map values.
/// Attribute values are JSON scalars or arrays/objects of scalars — this
/// bounds how deep the `serde_json::Value` tree is allowed to go so a
/// pathological payload can't blow up reducer memory.
pub const MAX_ATTR_DEPTH: usize = 4;

/// Returns `true` if every value in `attrs` nests no deeper than
/// [`MAX_ATTR_DEPTH`].
pub fn attrs_within_depth(attrs: &HashMap<String, serde_json::Value>) -> bool {
    fn depth(value: &serde_json::Value) -> usize {
        match value {
            serde_json::Value::Array(items) => {
                1 + items.iter().map(depth).max().unwrap_or(0)
            }
            serde_json::Value::Object(map) => {
                1 + map.values().map(depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }
    attrs.values().all(|v| depth(v) <= MAX_ATTR_DEPTH)
}

/// An identity-bearing node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub attrs: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Entity names are compared by their normalized form; this is the
    /// projection used for the `(projectId, normalize(name))` uniqueness
    /// invariant.
    pub fn normalized_name(&self) -> String {
        normalize(&self.name)
    }
}

/// Where an [`Observation`]'s text came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationSource {
    Manual { reference: Option<String> },
    Tool { reference: Option<String> },
    Import { reference: Option<String> },
    Agent { reference: Option<String> },
}

impl Default for ObservationSource {
    fn default() -> Self {
        ObservationSource::Manual { reference: None }
    }
}

/// A free-text fact attached to exactly one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub entity_id: EntityId,
    pub text: String,
    #[serde(default)]
    pub source: ObservationSource,
    pub timestamp: DateTime<Utc>,
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub from_id: EntityId,
    pub to_id: EntityId,
    pub relation_type: String,
    pub created_at: DateTime<Utc>,
}

/// One record in the append-only event log. Every variant other than
/// `Marker` carries `ts`. This type models only *structurally valid*
/// events — a backend's loader is responsible for skipping bytes that
/// don't even parse this far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    Marker {
        source: String,
        version: String,
    },
    EntityUpsert {
        id: EntityId,
        name: String,
        entity_type: String,
        #[serde(default)]
        attrs: HashMap<String, serde_json::Value>,
        ts: DateTime<Utc>,
    },
    ObservationAdd {
        id: ObservationId,
        entity_id: EntityId,
        text: String,
        #[serde(default)]
        source: ObservationSource,
        ts: DateTime<Utc>,
    },
    RelationAdd {
        id: RelationId,
        from_id: EntityId,
        to_id: EntityId,
        relation_type: String,
        ts: DateTime<Utc>,
    },
    RelationRemove {
        id: RelationId,
        ts: DateTime<Utc>,
    },
    EntityDelete {
        id: EntityId,
        ts: DateTime<Utc>,
    },
    ObservationDelete {
        id: ObservationId,
        ts: DateTime<Utc>,
    },
    SnapshotWritten {
        generation: String,
        ts: DateTime<Utc>,
    },
}

impl GraphEvent {
    /// The marker record's fixed store-type discriminant. Every fresh log's
    /// first record carries this, and every reader validates it before
    /// trusting the rest of the log.
    pub const MARKER_SOURCE: &'static str = "memory_bank_graph";
    pub const MARKER_VERSION: &'static str = "1";

    pub fn marker() -> Self {
        GraphEvent::Marker {
            source: Self::MARKER_SOURCE.to_string(),
            version: Self::MARKER_VERSION.to_string(),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, GraphEvent::Marker { .. })
    }
}

/// Metadata describing a materialized [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub store_type: String,
    pub version: String,
    pub store_id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
}

/// The materialized, derived state of a store: never authoritative, always
/// reconstructible from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub entities: HashMap<EntityId, Entity>,
    pub observations: HashMap<ObservationId, Observation>,
    pub relations: HashMap<RelationId, Relation>,
}

impl Snapshot {
    pub fn empty(store_id: impl Into<String>) -> Self {
        Snapshot {
            meta: SnapshotMeta {
                store_type: GraphEvent::MARKER_SOURCE.to_string(),
                version: GraphEvent::MARKER_VERSION.to_string(),
                store_id: store_id.into(),
                created_at: Utc::now(),
                source: "reducer".to_string(),
            },
            entities: HashMap::new(),
            observations: HashMap::new(),
            relations: HashMap::new(),
        }
    }
}

/// Summary counts attached to a [`GraphIndex`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub entity_count: usize,
    pub observation_count: usize,
    pub relation_count: usize,
}

/// Secondary structures rebuilt from a snapshot — never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphIndex {
    pub name_to_entity_id: HashMap<String, EntityId>,
    pub last_event_line_count: u64,
    pub snapshot_built_at: DateTime<Utc>,
    pub jsonl_modified_at: Option<DateTime<Utc>>,
    pub stats: IndexStats,
}

impl GraphIndex {
    pub fn build(snapshot: &Snapshot, last_event_line_count: u64) -> Self {
        let name_to_entity_id = snapshot
            .entities
            .values()
            .map(|e| (e.normalized_name(), e.id.clone()))
            .collect();
        GraphIndex {
            name_to_entity_id,
            last_event_line_count,
            snapshot_built_at: Utc::now(),
            jsonl_modified_at: None,
            stats: IndexStats {
                entity_count: snapshot.entities.len(),
                observation_count: snapshot.observations.len(),
                relation_count: snapshot.relations.len(),
            },
        }
    }
}

/// `(userId, projectId)`, carried on every request as the basis for
/// row-level isolation. Never cached across requests — a fresh value is
/// attached per request by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub user_id: String,
    pub project_id: String,
}

/// A `(path, optional heading)` link from a graph entity to a document,
/// extracted from `attrs.docPath`/`heading` or a `DOC:` observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPointer {
    pub path: String,
    pub heading: Option<String>,
    /// Score of the entity this pointer was extracted from; used for the
    /// ranking comparator in the retrieval engine, not serialized input.
    #[serde(skip)]
    pub entity_score: f32,
    #[serde(skip)]
    pub is_core_file: bool,
}
