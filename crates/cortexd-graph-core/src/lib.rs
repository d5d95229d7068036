#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-graph-core** – the event log contract, the reducer, the
//! snapshot freshness protocol, and the search/neighborhood algorithms
//! shared by both graph store backends.
//!
//! This crate defines what a store *is* without saying how bytes hit disk
//! or a database — `cortexd-graph-file` and `cortexd-graph-sql` provide
//! that, each implementing [`GraphStore`] and [`EventLog`] for their own
//! medium.

mod cache;
mod compactor;
mod neighborhood;
mod reducer;
mod search;
mod store;

pub use cache::{Generation, SnapshotCache};
pub use compactor::minimal_events;
pub use neighborhood::expand;
pub use reducer::{fold, ReduceWarning};
pub use search::{search_entities, search_observations, search_relations, SearchOptions, SearchResults};
pub use store::{CompactionReport, EntityRef, EventLog, GraphStore};
