//! Rewrites a live snapshot as the minimal event sequence that reconstructs
//! it: one marker, then one `entity_upsert` per live entity, one
//! `observation_add` per live observation, one `relation_add` per live
//! relation. Ordering is deterministic (sorted by id) so two compactions of
//! the same snapshot produce byte-identical output.

use cortexd_types::{GraphEvent, Snapshot};

pub fn minimal_events(snapshot: &Snapshot) -> Vec<GraphEvent> {
    let mut events = Vec::with_capacity(1 + snapshot.entities.len() + snapshot.observations.len() + snapshot.relations.len());
    events.push(GraphEvent::marker());

    let mut entities: Vec<_> = snapshot.entities.values().collect();
    entities.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    for entity in entities {
        events.push(GraphEvent::EntityUpsert {
            id: entity.id.clone(),
            name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            attrs: entity.attrs.clone(),
            ts: entity.updated_at,
        });
    }

    let mut observations: Vec<_> = snapshot.observations.values().collect();
    observations.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    for observation in observations {
        events.push(GraphEvent::ObservationAdd {
            id: observation.id.clone(),
            entity_id: observation.entity_id.clone(),
            text: observation.text.clone(),
            source: observation.source.clone(),
            ts: observation.timestamp,
        });
    }

    let mut relations: Vec<_> = snapshot.relations.values().collect();
    relations.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    for relation in relations {
        events.push(GraphEvent::RelationAdd {
            id: relation.id.clone(),
            from_id: relation.from_id.clone(),
            to_id: relation.to_id.clone(),
            relation_type: relation.relation_type.clone(),
            ts: relation.created_at,
        });
    }

    events
}
