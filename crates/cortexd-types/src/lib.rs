#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![allow(clippy::module_inception)]

//! **cortexd-types** – shared identifiers, the graph data model, and the
//! error taxonomy used across the cortexd workspace.
//!
//! Nothing in this crate touches storage, the network, or the filesystem —
//! it exists so every other crate can agree on what an `Entity` or a
//! `CortexError` is without depending on each other.

mod error;
mod id;
mod model;

pub use error::{CortexError, CortexResult, ErrorKind};
pub use id::{normalize, EntityId, ObservationId, RelationId};
pub use model::{
    attrs_within_depth, DocumentPointer, Entity, GraphEvent, GraphIndex, IndexStats, Observation,
    ObservationSource, Relation, Snapshot, SnapshotMeta, Tenant, MAX_ATTR_DEPTH,
};
