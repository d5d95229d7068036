//! The axum routes: session creation/submission, SSE replay+live stream,
//! and session close.

use crate::event_store::EventStore;
use crate::handler::SessionHandlerFactory;
use crate::origin::{host_allowed, origin_allowed};
use crate::session::SessionMap;
use axum::extract::{Extension, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use cortexd_types::Tenant;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

const SESSION_HEADER: &str = "x-cortexd-session";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Everything a request handler needs: the session map, the durable event
/// store behind it, and the factory that builds a handler for a newly
/// created session.
#[derive(Clone)]
pub struct AppState {
    /// The concurrent session map.
    pub session_map: Arc<SessionMap>,
    /// The durable store every server→client message is persisted to.
    pub event_store: Arc<dyn EventStore>,
    /// Builds the per-session RPC handler for a newly created session.
    pub handler_factory: Arc<dyn SessionHandlerFactory>,
    /// Acceptable `Origin` header values; empty means unconfigured.
    pub origin_allowlist: Arc<Vec<String>>,
    /// Acceptable `Host` header values; empty means unconfigured.
    pub host_allowlist: Arc<Vec<String>>,
}

/// Builds the `/session` router over `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(submit).get(open_stream).delete(close_session))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers.get(SESSION_HEADER).and_then(|value| value.to_str().ok()).map(str::to_string)
}

fn last_event_id_from_headers(headers: &HeaderMap) -> u64 {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn cross_origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let origin = headers.get(header::ORIGIN).and_then(|value| value.to_str().ok());
    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok()).unwrap_or("");
    origin_allowed(origin, &state.origin_allowlist) && host_allowed(host, &state.host_allowlist)
}

fn session_header_value(session_id: &str) -> Result<(HeaderName, HeaderValue), StatusCode> {
    let value = HeaderValue::from_str(session_id).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok((HeaderName::from_static(SESSION_HEADER), value))
}

async fn submit(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, StatusCode> {
    if !cross_origin_allowed(&state, &headers) {
        return Err(StatusCode::FORBIDDEN);
    }

    let existing_id = session_id_from_headers(&headers);
    let created = existing_id.is_none();

    let session = match existing_id {
        Some(id) => {
            let session = state.session_map.get(&id).await.map_err(|_| StatusCode::NOT_FOUND)?;
            if session.tenant != tenant {
                return Err(StatusCode::FORBIDDEN);
            }
            session
        }
        None => {
            let handler = state.handler_factory.build(tenant.clone()).await.map_err(|err| {
                tracing::error!(error = %err, "failed to build session handler");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            state.session_map.create(tenant, handler).await
        }
    };

    let messages = session.handler.handle(body).await.map_err(|err| {
        tracing::warn!(session_id = %session.id, error = %err, "session handler rejected request");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    for message in messages {
        session.emit(state.event_store.as_ref(), message).await.map_err(|err| {
            tracing::error!(session_id = %session.id, error = %err, "failed to persist outgoing event");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    }

    let status = if created { StatusCode::CREATED } else { StatusCode::ACCEPTED };
    let mut response = status.into_response();
    let (name, value) = session_header_value(&session.id)?;
    response.headers_mut().insert(name, value);
    Ok(response)
}

async fn open_stream(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !cross_origin_allowed(&state, &headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    let session_id = session_id_from_headers(&headers).ok_or(StatusCode::NOT_FOUND)?;
    let session = state.session_map.get(&session_id).await.map_err(|_| StatusCode::NOT_FOUND)?;
    if session.tenant != tenant {
        return Err(StatusCode::FORBIDDEN);
    }

    let last_event_id = last_event_id_from_headers(&headers);
    let replayed = state
        .event_store
        .replay_after(&session_id, last_event_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let live = BroadcastStream::new(session.subscribe()).filter_map(|item| async move { item.ok() });
    let combined = stream::iter(replayed).chain(live);
    let sse_stream = combined.map(|stored| {
        Ok(Event::default()
            .id(stored.event_id.to_string())
            .json_data(stored.payload)
            .unwrap_or_else(|_| Event::default()))
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

async fn close_session(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    headers: HeaderMap,
) -> StatusCode {
    if !cross_origin_allowed(&state, &headers) {
        return StatusCode::FORBIDDEN;
    }
    let Some(session_id) = session_id_from_headers(&headers) else {
        return StatusCode::BAD_REQUEST;
    };
    match state.session_map.get(&session_id).await {
        Ok(session) if session.tenant == tenant => {
            state.session_map.remove(&session_id).await;
            let _ = state.event_store.drop_stream(&session_id).await;
            StatusCode::NO_CONTENT
        }
        Ok(_) => StatusCode::FORBIDDEN,
        Err(_) => StatusCode::NOT_FOUND,
    }
}
