//! The reducer: a pure, deterministic fold from an event sequence to a
//! [`Snapshot`]. Same input sequence, same snapshot — on any process, on
//! any host. Malformed or unrecognized records never abort the fold; they
//! are collected as [`ReduceWarning`]s instead.

use chrono::Utc;
use cortexd_types::{
    CortexError, CortexResult, Entity, GraphEvent, Observation, Relation, Snapshot, SnapshotMeta,
};

/// A non-fatal anomaly encountered while folding events. The reducer keeps
/// going; callers decide whether to surface these (e.g. the file backend
/// logs them as `tracing::warn!`).
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceWarning {
    /// Position of the offending record in the input sequence.
    pub index: usize,
    /// Human-readable description of what was wrong with it.
    pub message: String,
}

/// Folds `events` into a [`Snapshot`]. `events[0]` must be a valid marker —
/// that is checked here (and returned as [`CortexError::MarkerMismatch`])
/// because a log with no valid header has no trustworthy store identity at
/// all, unlike a bad record further in, which is merely skipped.
pub fn fold(store_id: &str, events: &[GraphEvent]) -> CortexResult<(Snapshot, Vec<ReduceWarning>)> {
    let warnings: Vec<ReduceWarning> = Vec::new();

    match events.first() {
        Some(GraphEvent::Marker { source, version }) => {
            if source != GraphEvent::MARKER_SOURCE || version != GraphEvent::MARKER_VERSION {
                return Err(CortexError::MarkerMismatch(format!(
                    "unexpected marker source/version: {source}/{version}"
                )));
            }
        }
        Some(_) => {
            return Err(CortexError::MarkerMismatch(
                "log[0] is not a marker record".to_string(),
            ))
        }
        None => return Err(CortexError::MarkerMismatch("log is empty".to_string())),
    }

    let mut snapshot = Snapshot::empty(store_id);
    snapshot.meta = SnapshotMeta {
        store_type: GraphEvent::MARKER_SOURCE.to_string(),
        version: GraphEvent::MARKER_VERSION.to_string(),
        store_id: store_id.to_string(),
        created_at: Utc::now(),
        source: "reducer".to_string(),
    };

    for event in events.iter().skip(1) {
        match event {
            GraphEvent::Marker { .. } | GraphEvent::SnapshotWritten { .. } => {
                // Any marker or snapshot_written after index 0 is metadata
                // noise from a previous run — ignored, not a warning.
            }
            GraphEvent::EntityUpsert {
                id,
                name,
                entity_type,
                attrs,
                ts,
            } => {
                let created_at = snapshot
                    .entities
                    .get(id)
                    .map(|existing| existing.created_at)
                    .unwrap_or(*ts);
                snapshot.entities.insert(
                    id.clone(),
                    Entity {
                        id: id.clone(),
                        name: name.clone(),
                        entity_type: entity_type.clone(),
                        attrs: attrs.clone(),
                        created_at,
                        updated_at: *ts,
                    },
                );
            }
            GraphEvent::ObservationAdd {
                id,
                entity_id,
                text,
                source,
                ts,
            } => {
                snapshot.observations.insert(
                    id.clone(),
                    Observation {
                        id: id.clone(),
                        entity_id: entity_id.clone(),
                        text: text.clone(),
                        source: source.clone(),
                        timestamp: *ts,
                    },
                );
            }
            GraphEvent::RelationAdd {
                id,
                from_id,
                to_id,
                relation_type,
                ts,
            } => {
                snapshot.relations.insert(
                    id.clone(),
                    Relation {
                        id: id.clone(),
                        from_id: from_id.clone(),
                        to_id: to_id.clone(),
                        relation_type: relation_type.clone(),
                        created_at: *ts,
                    },
                );
            }
            GraphEvent::RelationRemove { id, .. } => {
                snapshot.relations.remove(id);
            }
            GraphEvent::EntityDelete { id, .. } => {
                snapshot.entities.remove(id);
                snapshot.observations.retain(|_, o| &o.entity_id != id);
                snapshot
                    .relations
                    .retain(|_, r| &r.from_id != id && &r.to_id != id);
            }
            GraphEvent::ObservationDelete { id, .. } => {
                snapshot.observations.remove(id);
            }
        }
    }

    Ok((snapshot, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortexd_types::{EntityId, ObservationSource, RelationId};
    use std::collections::HashMap;

    fn marker() -> GraphEvent {
        GraphEvent::marker()
    }

    #[test]
    fn scenario_a_append_reduce_round_trip() {
        let alice = EntityId::derive("Alice", "person");
        let project = EntityId::derive("Project X", "project");
        let rel = RelationId::derive(&alice, &project, "works_on");
        let now = Utc::now();

        let events = vec![
            marker(),
            GraphEvent::EntityUpsert {
                id: alice.clone(),
                name: "Alice".into(),
                entity_type: "person".into(),
                attrs: HashMap::new(),
                ts: now,
            },
            GraphEvent::EntityUpsert {
                id: project.clone(),
                name: "Project X".into(),
                entity_type: "project".into(),
                attrs: HashMap::new(),
                ts: now,
            },
            GraphEvent::RelationAdd {
                id: rel.clone(),
                from_id: alice.clone(),
                to_id: project.clone(),
                relation_type: "works_on".into(),
                ts: now,
            },
            GraphEvent::ObservationAdd {
                id: cortexd_types::ObservationId::derive(&alice, "is a great dev", now),
                entity_id: alice.clone(),
                text: "is a great dev".into(),
                source: ObservationSource::Manual { reference: None },
                ts: now,
            },
            // Re-linking the same triple must be a no-op on the snapshot.
            GraphEvent::RelationAdd {
                id: rel.clone(),
                from_id: alice.clone(),
                to_id: project.clone(),
                relation_type: "works_on".into(),
                ts: now,
            },
        ];

        let (snapshot, warnings) = fold("store-a", &events).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.observations.len(), 1);
        assert_eq!(snapshot.relations.len(), 1);
    }

    #[test]
    fn scenario_b_cascading_delete() {
        let alice = EntityId::derive("Alice", "person");
        let project = EntityId::derive("Project X", "project");
        let rel = RelationId::derive(&alice, &project, "works_on");
        let now = Utc::now();

        let events = vec![
            marker(),
            GraphEvent::EntityUpsert {
                id: alice.clone(),
                name: "Alice".into(),
                entity_type: "person".into(),
                attrs: HashMap::new(),
                ts: now,
            },
            GraphEvent::EntityUpsert {
                id: project.clone(),
                name: "Project X".into(),
                entity_type: "project".into(),
                attrs: HashMap::new(),
                ts: now,
            },
            GraphEvent::RelationAdd {
                id: rel,
                from_id: alice.clone(),
                to_id: project.clone(),
                relation_type: "works_on".into(),
                ts: now,
            },
            GraphEvent::ObservationAdd {
                id: cortexd_types::ObservationId::derive(&alice, "is a great dev", now),
                entity_id: alice.clone(),
                text: "is a great dev".into(),
                source: ObservationSource::Manual { reference: None },
                ts: now,
            },
            GraphEvent::EntityDelete {
                id: alice,
                ts: now,
            },
        ];

        let (snapshot, _) = fold("store-b", &events).unwrap();
        assert_eq!(snapshot.entities.len(), 1);
        assert!(snapshot.observations.is_empty());
        assert!(snapshot.relations.is_empty());
    }

    #[test]
    fn missing_marker_is_rejected() {
        let now = Utc::now();
        let events = vec![GraphEvent::EntityDelete {
            id: EntityId::derive("x", "y"),
            ts: now,
        }];
        let err = fold("store-c", &events).unwrap_err();
        assert_eq!(err.kind(), cortexd_types::ErrorKind::MarkerMismatch);
    }

    #[test]
    fn relation_remove_absent_is_noop() {
        let events = vec![
            marker(),
            GraphEvent::RelationRemove {
                id: RelationId::derive(
                    &EntityId::derive("a", "t"),
                    &EntityId::derive("b", "t"),
                    "rel",
                ),
                ts: Utc::now(),
            },
        ];
        let (snapshot, warnings) = fold("store-d", &events).unwrap();
        assert!(snapshot.relations.is_empty());
        assert!(warnings.is_empty());
    }
}
