//! Server configuration: defaults, overridden by `CORTEXD_*` environment
//! variables, overridden again by CLI flags.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which `GraphStore`/`DocumentStore` implementation backs every tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One directory per tenant under `data_dir`.
    File,
    /// A shared Postgres pool, isolated by row-level security.
    Relational,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to, e.g. `"0.0.0.0:8080"`.
    pub bind_addr: String,
    /// Which backend every tenant's `GraphStore`/`DocumentStore` uses.
    pub backend: BackendKind,
    /// Root directory for the file backend; ignored for `Relational`.
    pub data_dir: String,
    /// Postgres connection string; required for `Relational`, and always
    /// used for the `api_keys` credential table regardless of backend.
    pub database_url: Option<String>,
    /// Idle session TTL, in seconds, before a session is treated as gone.
    pub session_ttl_seconds: i64,
    /// Requests per window allowed per authenticated user.
    pub rate_limit_per_user: u32,
    /// Requests per window allowed per client IP.
    pub rate_limit_per_ip: u32,
    /// Width of the rate limit window, in seconds.
    pub rate_limit_window_seconds: u64,
    /// Seconds an `AuthGate` cache entry is trusted before re-checking
    /// persistent storage.
    pub auth_cache_ttl_seconds: u64,
    /// Acceptable `Origin` header values; empty permits any.
    pub origin_allowlist: Vec<String>,
    /// Acceptable `Host` header values; empty permits any.
    pub host_allowlist: Vec<String>,
}

impl ServerConfig {
    /// Loads configuration from built-in defaults, then `CORTEXD_*`
    /// environment variables (list-valued fields are `,`-separated).
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("bind_addr", "0.0.0.0:8080")?
            .set_default("backend", "file")?
            .set_default("data_dir", "data/stores")?
            .set_default("database_url", None::<String>)?
            .set_default("session_ttl_seconds", 86400)?
            .set_default("rate_limit_per_user", 120)?
            .set_default("rate_limit_per_ip", 240)?
            .set_default("rate_limit_window_seconds", 60)?
            .set_default("auth_cache_ttl_seconds", 300)?
            .set_default("origin_allowlist", Vec::<String>::new())?
            .set_default("host_allowlist", Vec::<String>::new())?
            .add_source(
                config::Environment::with_prefix("CORTEXD")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("origin_allowlist")
                    .with_list_parse_key("host_allowlist")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        settings
            .try_deserialize()
            .context("failed to deserialize server configuration")
    }
}
