#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-tenant** – the sole legal path from a raw `(user_id,
//! project_id)` pair to a [`RelationalBackend`]. Every caller that needs
//! relational storage goes through [`TenantContext::run`] instead of
//! constructing a backend directly, so tenant identifiers are always
//! validated before they reach a query.

mod scoped_store;

pub use scoped_store::TenantScopedGraphStore;

use std::future::Future;

use cortexd_graph_sql::RelationalBackend;
use cortexd_types::{CortexError, CortexResult, Tenant};
use sqlx::{PgPool, Postgres, Transaction};

fn sql_err(err: sqlx::Error) -> CortexError {
    CortexError::IoError(format!("postgres error: {err}"))
}

const MAX_IDENTIFIER_LEN: usize = 256;

fn validate_identifier(kind: &str, value: &str) -> CortexResult<()> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        tracing::warn!(kind, len = value.len(), "rejected tenant identifier with invalid length");
        return Err(CortexError::TenantDenied);
    }
    // Postgres text columns reject embedded NUL bytes outright; catch it
    // here so it surfaces as a tenant-denied error, not a query failure.
    if value.contains('\0') {
        tracing::warn!(kind, "rejected tenant identifier containing a NUL byte");
        return Err(CortexError::TenantDenied);
    }
    Ok(())
}

/// Holds the shared pool every tenant's backend is built from.
pub struct TenantContext {
    pool: PgPool,
}

impl TenantContext {
    /// Wraps a pool already migrated via `cortexd_graph_sql::ensure_schema`.
    pub fn new(pool: PgPool) -> Self {
        TenantContext { pool }
    }

    /// Validates `user_id`/`project_id`, builds a [`RelationalBackend`]
    /// scoped to that tenant, and runs `f` against it. `f` receives an
    /// owned backend rather than a reference so it can be moved into
    /// spawned tasks if the caller needs to.
    pub async fn run<F, Fut, T>(&self, user_id: &str, project_id: &str, f: F) -> CortexResult<T>
    where
        F: FnOnce(RelationalBackend) -> Fut,
        Fut: Future<Output = CortexResult<T>>,
    {
        validate_identifier("user_id", user_id)?;
        validate_identifier("project_id", project_id)?;

        let tenant = Tenant {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
        };
        let backend = RelationalBackend::new(self.pool.clone(), tenant);
        f(backend).await
    }

    /// Opens a transaction and sets the two RLS session variables for
    /// `user_id`/`project_id`, for collaborators that need direct
    /// parameterized SQL access scoped to a tenant without going through
    /// [`RelationalBackend`] (e.g. a document store). The caller commits or
    /// lets the transaction drop to roll back.
    pub async fn scoped_tx(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> CortexResult<Transaction<'_, Postgres>> {
        validate_identifier("user_id", user_id)?;
        validate_identifier("project_id", project_id)?;

        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("SELECT set_config('app.current_user_id', $1, true)")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        sqlx::query("SELECT set_config('app.current_project_id', $1, true)")
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifier() {
        assert!(validate_identifier("user_id", "").is_err());
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(validate_identifier("project_id", "abc\0def").is_err());
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier("user_id", &long).is_err());
    }

    #[test]
    fn accepts_normal_identifier() {
        assert!(validate_identifier("user_id", "user-42").is_ok());
    }
}
