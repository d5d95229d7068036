//! Binary entry point: loads configuration, wires the auth, rate-limit,
//! and session-transport layers together, and serves the `/session` HTTP
//! surface until a shutdown signal arrives.

mod config;
mod handler;
mod middleware;
mod rpc;

use anyhow::{Context, Result};
use axum::middleware as axum_middleware;
use clap::Parser;
use config::{BackendKind, ServerConfig};
use cortexd_auth::{ensure_api_keys_schema, AuthGate, PgCredentialStore};
use cortexd_ratelimit::{InMemoryCounterStore, RateLimiter};
use cortexd_retrieval::ensure_documents_schema;
use cortexd_tenant::TenantContext;
use cortexd_transport::{
    build_router, ensure_rpc_events_schema, spawn_expiry_sweeper, AppState, EventStore, InMemoryEventStore,
    PgEventStore, SessionMap,
};
use handler::CortexSessionHandlerFactory;
use middleware::GateState;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Seconds between expiry sweeps of the in-memory session table.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "cortexd-server", about = "Multi-tenant context-memory server")]
struct Cli {
    /// Overrides `bind_addr` from configuration.
    #[arg(long)]
    bind: Option<String>,

    /// Log filter passed to `tracing_subscriber::EnvFilter`, e.g. `info` or
    /// `cortexd_server=debug,tower_http=info`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cortexd-server");

    let mut config = ServerConfig::load().context("loading server configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let database_url = config
        .database_url
        .clone()
        .context("database_url is required: api_keys credential storage always lives in postgres")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;

    ensure_api_keys_schema(&pool)
        .await
        .context("ensuring api_keys schema")?;

    let tenant_context = match config.backend {
        BackendKind::Relational => {
            cortexd_graph_sql::ensure_schema(&pool)
                .await
                .context("ensuring graph schema")?;
            ensure_documents_schema(&pool)
                .await
                .context("ensuring documents schema")?;
            Some(Arc::new(TenantContext::new(pool.clone())))
        }
        BackendKind::File => None,
    };

    // The durable event store is required for replay to survive a
    // restart; the in-memory ring is only correct for a single process's
    // lifetime, so it's reserved for the file backend's all-local setup.
    let event_store: Arc<dyn EventStore> = match config.backend {
        BackendKind::Relational => {
            ensure_rpc_events_schema(&pool)
                .await
                .context("ensuring rpc_events schema")?;
            Arc::new(PgEventStore::new(pool.clone()))
        }
        BackendKind::File => Arc::new(InMemoryEventStore::new()),
    };

    let credential_store = Arc::new(PgCredentialStore::new(pool.clone()));
    let auth_gate = Arc::new(AuthGate::with_cache_ttl(
        credential_store,
        Duration::from_secs(config.auth_cache_ttl_seconds),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryCounterStore::new())));

    let handler_factory = Arc::new(CortexSessionHandlerFactory::new(&config, tenant_context));
    let session_map = Arc::new(SessionMap::new(config.session_ttl_seconds));
    spawn_expiry_sweeper(session_map.clone(), SESSION_SWEEP_INTERVAL);

    let app_state = AppState {
        session_map,
        event_store,
        handler_factory,
        origin_allowlist: Arc::new(config.origin_allowlist.clone()),
        host_allowlist: Arc::new(config.host_allowlist.clone()),
    };

    let gate_state = GateState {
        auth_gate,
        rate_limiter,
        rate_limit_per_ip: config.rate_limit_per_ip,
        rate_limit_window_seconds: config.rate_limit_window_seconds,
    };

    let app = build_router(app_state).layer(axum_middleware::from_fn_with_state(
        gate_state,
        middleware::auth_and_rate_limit,
    ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding to {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    tracing::info!("cortexd-server stopped");
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
