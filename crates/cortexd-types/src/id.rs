//! Content-derived identifiers for graph entities, observations, and relations.
//!
//! Every id is a collision-resistant hash of its defining fields, prefixed
//! so the kind of thing an id points at is visible at a glance (`ent_…`,
//! `obs_…`, `rel_…`). Ids are never assigned by a counter: re-deriving from
//! the same fields always yields the same id, which is what makes upserts
//! and relation linking idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

fn content_hash(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    hex::encode(&digest.as_bytes()[..16])
}

/// Lowercases, trims, and collapses internal whitespace runs to a single
/// space. Used wherever the spec calls for a "normalized" name comparison.
pub fn normalize(name: &str) -> String {
    name.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

macro_rules! content_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an already-formatted id string (e.g. loaded from storage).
            /// Does not validate the prefix; callers that need that should use
            /// `from_str`-style construction at the storage boundary instead.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

content_id!(EntityId, "ent_");
content_id!(ObservationId, "obs_");
content_id!(RelationId, "rel_");

impl EntityId {
    /// Derives an entity id from `(normalize(name), entityType)`.
    pub fn derive(name: &str, entity_type: &str) -> Self {
        let hash = content_hash(&[normalize(name).as_bytes(), entity_type.as_bytes()]);
        Self(format!("ent_{hash}"))
    }
}

impl ObservationId {
    /// Derives an observation id from `(entityId, text, timestamp)`.
    ///
    /// Re-adding identical text at a different timestamp intentionally
    /// produces a different id and therefore a second observation — this is
    /// a deliberate property of the system, not an omission.
    pub fn derive(entity_id: &EntityId, text: &str, timestamp: DateTime<Utc>) -> Self {
        let hash = content_hash(&[
            entity_id.as_str().as_bytes(),
            text.as_bytes(),
            timestamp.to_rfc3339().as_bytes(),
        ]);
        Self(format!("obs_{hash}"))
    }
}

impl RelationId {
    /// Derives a relation id from `(fromId, toId, relationType)`. Because the
    /// id depends only on these three fields, re-linking the same triple
    /// always resolves to the same id — the source of relation idempotency.
    pub fn derive(from_id: &EntityId, to_id: &EntityId, relation_type: &str) -> Self {
        let hash = content_hash(&[
            from_id.as_str().as_bytes(),
            to_id.as_str().as_bytes(),
            relation_type.as_bytes(),
        ]);
        Self(format!("rel_{hash}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  Alice   Smith \n"), "alice smith");
    }

    #[test]
    fn entity_id_is_deterministic() {
        let a = EntityId::derive("Alice", "person");
        let b = EntityId::derive("  alice  ", "person");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("ent_"));
    }

    #[test]
    fn entity_id_differs_by_type() {
        let a = EntityId::derive("Alice", "person");
        let b = EntityId::derive("Alice", "project");
        assert_ne!(a, b);
    }

    #[test]
    fn relation_id_is_order_sensitive() {
        let a = EntityId::derive("Alice", "person");
        let b = EntityId::derive("Project X", "project");
        let r1 = RelationId::derive(&a, &b, "works_on");
        let r2 = RelationId::derive(&b, &a, "works_on");
        assert_ne!(r1, r2);
    }

    #[test]
    fn observation_id_varies_by_timestamp() {
        let entity = EntityId::derive("Alice", "person");
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);
        let o1 = ObservationId::derive(&entity, "is a great dev", t1);
        let o2 = ObservationId::derive(&entity, "is a great dev", t2);
        assert_ne!(o1, o2);
    }
}
