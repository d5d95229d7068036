#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-transport** – the HTTP+SSE session transport. A session binds
//! one tenant for its lifetime; server→client messages are persisted to an
//! [`EventStore`] before delivery so a reconnecting client can replay
//! exactly what it missed by `Last-Event-Id`. What a submitted request
//! *means* is decided by whatever [`SessionHandler`] the embedding server
//! supplies — this crate only owns session lifecycle, ordering, and
//! cross-origin protection.

mod event_store;
mod handler;
mod origin;
mod router;
mod session;

pub use event_store::{ensure_rpc_events_schema, EventStore, InMemoryEventStore, PgEventStore, StoredEvent};
pub use handler::{SessionHandler, SessionHandlerFactory};
pub use origin::{host_allowed, origin_allowed};
pub use router::{build_router, AppState};
pub use session::{Session, SessionMap};

use std::sync::Arc;
use std::time::Duration;

/// Spawns a background task that periodically sweeps expired sessions out
/// of `session_map`. Purely a memory bound; [`SessionMap::get`] already
/// treats an expired session as gone on its own.
pub fn spawn_expiry_sweeper(session_map: Arc<SessionMap>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = session_map.sweep_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "swept expired sessions");
            }
        }
    });
}
