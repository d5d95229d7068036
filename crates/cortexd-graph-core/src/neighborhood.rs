//! 1–2 hop BFS expansion over relations from a seed set of entities.

use cortexd_types::{Entity, EntityId, Relation, Snapshot};
use std::collections::BTreeSet;

/// Expands `seeds` by up to `depth` hops (clamped to the 1–2 range the
/// system supports), following relations in both directions. Ordering is
/// deterministic: BFS level by level, ties broken by entity id.
pub fn expand(snapshot: &Snapshot, seeds: &[EntityId], depth: u8) -> (Vec<Entity>, Vec<Relation>) {
    let depth = depth.clamp(1, 2);
    let mut visited: BTreeSet<EntityId> = seeds.iter().cloned().collect();
    let mut frontier: Vec<EntityId> = seeds.to_vec();
    frontier.sort();

    for _ in 0..depth {
        let mut next: BTreeSet<EntityId> = BTreeSet::new();
        for id in &frontier {
            for relation in snapshot.relations.values() {
                if &relation.from_id == id && !visited.contains(&relation.to_id) {
                    next.insert(relation.to_id.clone());
                }
                if &relation.to_id == id && !visited.contains(&relation.from_id) {
                    next.insert(relation.from_id.clone());
                }
            }
        }
        if next.is_empty() {
            break;
        }
        visited.extend(next.iter().cloned());
        frontier = next.into_iter().collect();
    }

    let entities: Vec<Entity> = visited
        .iter()
        .filter_map(|id| snapshot.entities.get(id).cloned())
        .collect();
    let relations: Vec<Relation> = snapshot
        .relations
        .values()
        .filter(|r| visited.contains(&r.from_id) && visited.contains(&r.to_id))
        .cloned()
        .collect();
    (entities, relations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cortexd_types::{Entity, Relation, RelationId};
    use std::collections::HashMap;

    fn entity(name: &str) -> Entity {
        Entity {
            id: EntityId::derive(name, "thing"),
            name: name.to_string(),
            entity_type: "thing".to_string(),
            attrs: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn depth_two_reaches_neighbors_of_neighbors() {
        let a = entity("a");
        let b = entity("b");
        let c = entity("c");
        let mut snapshot = Snapshot::empty("s");
        let ab_id = RelationId::derive(&a.id, &b.id, "knows");
        let bc_id = RelationId::derive(&b.id, &c.id, "knows");
        snapshot.relations.insert(
            ab_id.clone(),
            Relation {
                id: ab_id,
                from_id: a.id.clone(),
                to_id: b.id.clone(),
                relation_type: "knows".into(),
                created_at: Utc::now(),
            },
        );
        snapshot.relations.insert(
            bc_id.clone(),
            Relation {
                id: bc_id,
                from_id: b.id.clone(),
                to_id: c.id.clone(),
                relation_type: "knows".into(),
                created_at: Utc::now(),
            },
        );
        snapshot.entities.insert(a.id.clone(), a.clone());
        snapshot.entities.insert(b.id.clone(), b.clone());
        snapshot.entities.insert(c.id.clone(), c.clone());

        let (entities_d1, _) = expand(&snapshot, &[a.id.clone()], 1);
        assert_eq!(entities_d1.len(), 2);

        let (entities_d2, relations_d2) = expand(&snapshot, &[a.id.clone()], 2);
        assert_eq!(entities_d2.len(), 3);
        assert_eq!(relations_d2.len(), 2);
    }
}
