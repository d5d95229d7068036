//! Persistent credential lookup. `api_keys` is consulted by hash before any
//! tenant is known, so unlike the other relational tables it is never
//! routed through `TenantContext` — there is no session-local tenant to set
//! yet. Row-level security on this table would be circular; it is instead
//! protected by never exposing the key hash outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_types::{CortexError, CortexResult};
use sqlx::{PgPool, Row};

fn sql_err(err: sqlx::Error) -> CortexError {
    CortexError::IoError(format!("postgres error: {err}"))
}

/// One row of the `api_keys` table.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub user_id: String,
    pub project_id: String,
    pub scopes: Vec<String>,
    pub rate_limit: u32,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The persistent side of [`crate::AuthGate`]'s cache-miss path.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Looks up the record for a credential's hash, `None` if no such key
    /// was ever issued.
    async fn lookup(&self, key_hash: &str) -> CortexResult<Option<ApiKeyRecord>>;
    /// Best-effort last-seen bump; failures are logged by the caller and
    /// never propagated.
    async fn touch_last_seen(&self, key_hash: &str) -> CortexResult<()>;
}

/// Creates the `api_keys` table if it doesn't already exist.
pub async fn ensure_api_keys_schema(pool: &PgPool) -> CortexResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            key_hash TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            scopes TEXT[] NOT NULL DEFAULT '{}',
            rate_limit INTEGER NOT NULL DEFAULT 60,
            revoked_at TIMESTAMPTZ,
            expires_at TIMESTAMPTZ,
            last_used_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;
    Ok(())
}

/// A [`CredentialStore`] backed by the relational `api_keys` table.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// Wraps an existing pool. Callers are expected to have already run
    /// [`ensure_api_keys_schema`] once at startup.
    pub fn new(pool: PgPool) -> Self {
        PgCredentialStore { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn lookup(&self, key_hash: &str) -> CortexResult<Option<ApiKeyRecord>> {
        let row = sqlx::query(
            "SELECT user_id, project_id, scopes, rate_limit, revoked_at, expires_at \
             FROM api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let rate_limit: i32 = row.try_get("rate_limit").map_err(sql_err)?;
        Ok(Some(ApiKeyRecord {
            user_id: row.try_get("user_id").map_err(sql_err)?,
            project_id: row.try_get("project_id").map_err(sql_err)?,
            scopes: row.try_get("scopes").map_err(sql_err)?,
            rate_limit: rate_limit.max(0) as u32,
            revoked_at: row.try_get("revoked_at").map_err(sql_err)?,
            expires_at: row.try_get("expires_at").map_err(sql_err)?,
        }))
    }

    async fn touch_last_seen(&self, key_hash: &str) -> CortexResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE key_hash = $2")
            .bind(Utc::now())
            .bind(key_hash)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}
