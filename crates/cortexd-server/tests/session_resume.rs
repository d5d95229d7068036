//! Scenario F: a dropped SSE stream resumes exactly where it left off,
//! driven entirely through `cortexd_transport`'s HTTP surface.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use cortexd_transport::{
    build_router, AppState, EventStore, InMemoryEventStore, SessionHandler, SessionHandlerFactory, SessionMap,
};
use cortexd_types::{CortexResult, Tenant};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Echoes the request back as the lone outgoing event, so each submitted
/// request deterministically produces exactly one event on the stream.
struct EchoHandler;

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn handle(&self, request: Value) -> CortexResult<Vec<Value>> {
        Ok(vec![request])
    }
}

struct EchoHandlerFactory;

#[async_trait]
impl SessionHandlerFactory for EchoHandlerFactory {
    async fn build(&self, _tenant: Tenant) -> CortexResult<Arc<dyn SessionHandler>> {
        Ok(Arc::new(EchoHandler))
    }
}

fn tenant() -> Tenant {
    Tenant {
        user_id: "userE".to_string(),
        project_id: "projectE".to_string(),
    }
}

fn test_state() -> AppState {
    AppState {
        session_map: Arc::new(SessionMap::new(3600)),
        event_store: Arc::new(InMemoryEventStore::new()),
        handler_factory: Arc::new(EchoHandlerFactory),
        origin_allowlist: Arc::new(Vec::new()),
        host_allowlist: Arc::new(Vec::new()),
    }
}

async fn submit(state: &AppState, session_id: Option<&str>, n: u64) -> (StatusCode, Option<String>) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/session")
        .header("content-type", "application/json")
        .extension(tenant());
    if let Some(id) = session_id {
        builder = builder.header("x-cortexd-session", id);
    }
    let request = builder.body(Body::from(json!({"n": n}).to_string())).unwrap();
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let session_header = response
        .headers()
        .get("x-cortexd-session")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (status, session_header)
}

#[tokio::test]
async fn reconnecting_with_last_event_id_replays_only_what_was_missed() {
    let state = test_state();

    let (status, session_id) = submit(&state, None, 1).await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session_id.expect("session id header on creation");

    for n in 2..=10u64 {
        let (status, _) = submit(&state, Some(&session_id), n).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    // Simulate a client that received events 1..=7 and then dropped: it
    // reconnects asking for everything after id 7.
    let replayed = state
        .event_store
        .replay_after(&session_id, 7)
        .await
        .unwrap();
    let ids: Vec<u64> = replayed.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![8, 9, 10]);
    let values: Vec<u64> = replayed
        .iter()
        .map(|e| e.payload["n"].as_u64().unwrap())
        .collect();
    assert_eq!(values, vec![8, 9, 10]);

    // New events submitted after resume keep extending the same sequence.
    let (status, _) = submit(&state, Some(&session_id), 11).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let replayed_again = state.event_store.replay_after(&session_id, 10).await.unwrap();
    assert_eq!(replayed_again.len(), 1);
    assert_eq!(replayed_again[0].event_id, 11);
}

#[tokio::test]
async fn closing_a_session_drops_its_event_history() {
    let state = test_state();
    let (_, session_id) = submit(&state, None, 1).await;
    let session_id = session_id.unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri("/session")
        .header("x-cortexd-session", session_id.clone())
        .extension(tenant())
        .body(Body::empty())
        .unwrap();
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let replayed = state.event_store.replay_after(&session_id, 0).await.unwrap();
    assert!(replayed.is_empty());
}

