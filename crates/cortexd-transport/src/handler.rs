//! The seam between session lifecycle (this crate) and RPC semantics
//! (whatever the embedding server wires up — graph operations, retrieval,
//! compaction).

use async_trait::async_trait;
use cortexd_types::{CortexResult, Tenant};
use serde_json::Value;
use std::sync::Arc;

/// Handles JSON-RPC requests submitted on one session. A handler instance
/// is isolated to the session it was built for; it never needs to
/// re-check the tenant it was constructed with.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Processes one submitted request, returning zero or more JSON
    /// messages to deliver to the client over its event stream. Returning
    /// more than one message lets a single request fan out into several
    /// server-initiated events (e.g. progress, then result).
    async fn handle(&self, request: Value) -> CortexResult<Vec<Value>>;
}

/// Builds a [`SessionHandler`] bound to a newly created session's tenant.
/// Constructing a handler is where the embedding server decides which
/// backend (file or relational) this tenant's calls run against.
#[async_trait]
pub trait SessionHandlerFactory: Send + Sync {
    /// Builds a handler isolated to `tenant`.
    async fn build(&self, tenant: Tenant) -> CortexResult<Arc<dyn SessionHandler>>;
}
