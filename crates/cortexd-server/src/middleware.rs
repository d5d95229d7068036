//! Sits in front of the session transport: resolves the presented
//! credential to a tenant, enforces the user/IP rate limit windows, and
//! attaches both to the request as extensions for the transport layer and
//! handlers downstream.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cortexd_auth::AuthGate;
use cortexd_ratelimit::{RateLimitDecision, RateLimitKey, RateLimiter};
use cortexd_types::Tenant;
use std::net::SocketAddr;
use std::sync::Arc;

/// Header carrying the opaque bearer credential.
pub const CREDENTIAL_HEADER: &str = "x-cortexd-credential";

/// Collaborators the auth+rate-limit layer needs on every request.
#[derive(Clone)]
pub struct GateState {
    /// Resolves a presented credential to its tenant and quota.
    pub auth_gate: Arc<AuthGate>,
    /// Enforces the per-user and per-IP request windows.
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-IP ceiling; the per-user ceiling comes from the credential's
    /// own `AuthContext::rate_limit` instead of a fixed config value.
    pub rate_limit_per_ip: u32,
    /// Width of both rate limit windows, in seconds.
    pub rate_limit_window_seconds: u64,
}

/// Authenticates the request, enforces rate limits, and inserts a
/// [`Tenant`] extension for everything downstream. Rejects with 401 on an
/// absent or invalid credential and 429 once either window is exhausted.
pub async fn auth_and_rate_limit(
    State(state): State<GateState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let credential = request
        .headers()
        .get(CREDENTIAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let auth_context = match state.auth_gate.authenticate(&credential).await {
        Ok(ctx) => ctx,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let user_key = RateLimitKey::UserId(auth_context.user_id.clone());
    let ip_key = RateLimitKey::IpAddress(addr.ip());
    let decision = state
        .rate_limiter
        .check_both(
            &user_key,
            &ip_key,
            auth_context.rate_limit,
            state.rate_limit_per_ip,
            state.rate_limit_window_seconds,
        )
        .await;

    if !decision.allowed {
        return rate_limited_response(decision);
    }

    let tenant = Tenant {
        user_id: auth_context.user_id,
        project_id: auth_context.project_id,
    };
    request.extensions_mut().insert(tenant);

    let mut response = next.run(request).await;
    apply_rate_limit_headers(&mut response, decision);
    response
}

fn rate_limited_response(decision: RateLimitDecision) -> Response {
    let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
    apply_rate_limit_headers(&mut response, decision);
    response
}

fn apply_rate_limit_headers(response: &mut Response, decision: RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_in_seconds.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}
