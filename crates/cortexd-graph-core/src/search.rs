//! In-memory search over a [`Snapshot`]: the "emergent" fulltext used by
//! the file backend (no persistent index — rescored on every query). The
//! relational backend has its own native-FTS search and does not use this
//! module, but shares its [`SearchResults`]/[`SearchOptions`] shape.

use cortexd_types::{normalize, Entity, EntityId, Observation, Relation, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Per-query cap on how many entities are scored, keeping response time
/// bounded regardless of graph size.
const MAX_ENTITIES_EXAMINED: usize = 5_000;

/// Hard cap on observation search results, independent of the caller's
/// requested limit.
const MAX_OBSERVATION_RESULTS: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Maximum number of entities returned.
    pub limit: usize,
    /// Neighborhood expansion depth to apply to the hits, 1 or 2.
    pub depth: u8,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions { limit: 20, depth: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    /// Entities matching the query, ranked by score.
    pub entities: Vec<Entity>,
    /// Observations whose text matches the query.
    pub observations: Vec<Observation>,
    /// Relations whose type matches the query, scoped to matched entities.
    pub relations: Vec<Relation>,
}

fn entity_score(entity: &Entity, normalized_query: &str) -> f32 {
    let name_norm = entity.normalized_name();
    if name_norm == normalized_query {
        return 1.0;
    }
    let mut score = 0.0f32;
    if name_norm.contains(normalized_query) {
        score = score.max(0.8);
    }
    if entity.entity_type.to_lowercase().contains(normalized_query) {
        score = score.max(0.5);
    }
    if entity
        .attrs
        .values()
        .filter_map(|v| v.as_str())
        .any(|s| s.to_lowercase().contains(normalized_query))
    {
        score = score.max(0.3);
    }
    score
}

/// Scores and ranks entities by the rules in the entity-search algorithm:
/// exact normalized-name match, then name substring, then type substring,
/// then attribute-value substring. Ties break by name ascending.
pub fn search_entities(snapshot: &Snapshot, query: &str, limit: usize) -> Vec<(Entity, f32)> {
    let normalized_query = normalize(query);
    let mut scored: Vec<(Entity, f32)> = snapshot
        .entities
        .values()
        .take(MAX_ENTITIES_EXAMINED)
        .filter_map(|entity| {
            let score = entity_score(entity, &normalized_query);
            (score > 0.0).then(|| (entity.clone(), score))
        })
        .collect();

    scored.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    scored.truncate(limit);
    scored
}

/// Substring search over observation text, most recent first (the file
/// backend has no ranked fulltext score to sort by, so recency is the
/// stand-in relevance signal). Always capped at 50 regardless of `limit`.
pub fn search_observations(snapshot: &Snapshot, query: &str, limit: usize) -> Vec<Observation> {
    let needle = query.to_lowercase();
    let mut matches: Vec<Observation> = snapshot
        .observations
        .values()
        .filter(|obs| obs.text.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matches.truncate(limit.min(MAX_OBSERVATION_RESULTS));
    matches
}

/// Relations whose type contains `query`, scoped to a set of entity ids
/// that survived a prior entity search — so relation results never point
/// at an entity the caller hasn't also seen.
pub fn search_relations(
    snapshot: &Snapshot,
    query: &str,
    scoped_entities: &HashSet<EntityId>,
) -> Vec<Relation> {
    let needle = query.to_lowercase();
    snapshot
        .relations
        .values()
        .filter(|rel| {
            rel.relation_type.to_lowercase().contains(&needle)
                && scoped_entities.contains(&rel.from_id)
                && scoped_entities.contains(&rel.to_id)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cortexd_types::Entity;
    use std::collections::HashMap;

    fn snapshot_with_entity(name: &str, entity_type: &str) -> Snapshot {
        let mut snapshot = Snapshot::empty("s");
        let id = EntityId::derive(name, entity_type);
        snapshot.entities.insert(
            id.clone(),
            Entity {
                id,
                name: name.to_string(),
                entity_type: entity_type.to_string(),
                attrs: HashMap::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        snapshot
    }

    #[test]
    fn exact_match_outranks_substring() {
        let mut snapshot = snapshot_with_entity("Alice", "person");
        let bob_id = EntityId::derive("Alice Bob", "person");
        snapshot.entities.insert(
            bob_id.clone(),
            Entity {
                id: bob_id,
                name: "Alice Bob".into(),
                entity_type: "person".into(),
                attrs: HashMap::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        let results = search_entities(&snapshot, "Alice", 10);
        assert_eq!(results[0].0.name, "Alice");
        assert_eq!(results[0].1, 1.0);
    }

    #[test]
    fn observation_search_is_substring_case_insensitive() {
        let mut snapshot = Snapshot::empty("s");
        let entity = EntityId::derive("Alice", "person");
        let obs_id = cortexd_types::ObservationId::derive(&entity, "Is A Great Dev", Utc::now());
        snapshot.observations.insert(
            obs_id.clone(),
            Observation {
                id: obs_id,
                entity_id: entity,
                text: "Is A Great Dev".into(),
                source: cortexd_types::ObservationSource::Manual { reference: None },
                timestamp: Utc::now(),
            },
        );
        let results = search_observations(&snapshot, "great dev", 10);
        assert_eq!(results.len(), 1);
    }
}
