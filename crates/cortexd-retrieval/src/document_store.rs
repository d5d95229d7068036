//! The narrow collaborator interface retrieval reads documents through,
//! plus two implementations: a POSIX-rooted directory and a Postgres
//! `documents` table accessed exclusively via [`cortexd_tenant::TenantContext`].

use async_trait::async_trait;
use chrono::Utc;
use cortexd_tenant::TenantContext;
use cortexd_types::{CortexError, CortexResult};
use sqlx::PgPool;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const ALLOWED_EXTENSIONS: [&str; 3] = ["md", "markdown", "txt"];

fn sql_err(err: sqlx::Error) -> CortexError {
    CortexError::IoError(format!("postgres error: {err}"))
}

/// Rejects an absolute path, any `..` component, and any embedded NUL byte.
/// Doesn't check the extension — used for `list`/`is_dir` prefixes, which
/// may name a directory rather than a document.
fn validate_relative_path(path: &str) -> CortexResult<PathBuf> {
    if path.contains('\0') {
        return Err(CortexError::invalid_input("path contains a NUL byte"));
    }
    let candidate = Path::new(path);
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(CortexError::invalid_input(
                    "path must be relative and may not traverse parent directories",
                ));
            }
        }
    }
    Ok(candidate.to_path_buf())
}

/// As [`validate_relative_path`], plus rejects any extension outside the
/// allowlist. Applied to `read`/`write`/`delete`, which always name one
/// document.
pub fn validate_path(path: &str) -> CortexResult<PathBuf> {
    let candidate = validate_relative_path(path)?;
    let extension = candidate
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(CortexError::invalid_input(format!(
            "unsupported document extension: {extension}"
        )));
    }
    Ok(candidate)
}

/// A document collaborator: plain files or relational rows, addressed by a
/// project-relative path.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document's full content.
    async fn read(&self, path: &str) -> CortexResult<String>;
    /// Creates or overwrites a document.
    async fn write(&self, path: &str, content: &str) -> CortexResult<()>;
    /// Lists every document path under `prefix`.
    async fn list(&self, prefix: &str) -> CortexResult<Vec<String>>;
    /// True if `path` names a directory rather than a document.
    async fn is_dir(&self, path: &str) -> CortexResult<bool>;
    /// Deletes a document; a no-op if it doesn't exist.
    async fn delete(&self, path: &str) -> CortexResult<()>;
}

/// A [`DocumentStore`] rooted at a directory on local disk.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Roots the store at `root`; every path passed to its methods is
    /// resolved relative to this directory and may never escape it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsDocumentStore { root: root.into() }
    }

    fn resolve_file(&self, path: &str) -> CortexResult<PathBuf> {
        Ok(self.root.join(validate_path(path)?))
    }

    fn resolve_prefix(&self, prefix: &str) -> CortexResult<PathBuf> {
        Ok(self.root.join(validate_relative_path(prefix)?))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, path: &str) -> CortexResult<String> {
        let full = self.resolve_file(path)?;
        Ok(tokio::fs::read_to_string(&full).await?)
    }

    async fn write(&self, path: &str, content: &str) -> CortexResult<()> {
        let full = self.resolve_file(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(&full, content).await?)
    }

    async fn list(&self, prefix: &str) -> CortexResult<Vec<String>> {
        let root_dir = self.resolve_prefix(prefix)?;
        let mut out = Vec::new();
        let mut stack = vec![root_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                    if let Some(relative) = relative.to_str() {
                        out.push(relative.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn is_dir(&self, path: &str) -> CortexResult<bool> {
        let full = self.resolve_prefix(path)?;
        Ok(tokio::fs::metadata(&full)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false))
    }

    async fn delete(&self, path: &str) -> CortexResult<()> {
        let full = self.resolve_file(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CortexError::from(err)),
        }
    }
}

/// Creates the `documents` table and its row-level security policy if it
/// doesn't already exist. Call once at startup, same as
/// `cortexd_graph_sql::ensure_schema`.
pub async fn ensure_documents_schema(pool: &PgPool) -> CortexResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            path TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, project_id, path)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    sqlx::query("ALTER TABLE documents ENABLE ROW LEVEL SECURITY")
        .execute(pool)
        .await
        .map_err(sql_err)?;
    sqlx::query("ALTER TABLE documents FORCE ROW LEVEL SECURITY")
        .execute(pool)
        .await
        .map_err(sql_err)?;

    let policy = "CREATE POLICY tenant_isolation ON documents \
        USING (user_id = current_setting('app.current_user_id', true) \
            AND project_id = current_setting('app.current_project_id', true)) \
        WITH CHECK (user_id = current_setting('app.current_user_id', true) \
            AND project_id = current_setting('app.current_project_id', true))";
    if let Err(err) = sqlx::query(policy).execute(pool).await {
        if !err.to_string().contains("already exists") {
            return Err(sql_err(err));
        }
    }
    Ok(())
}

/// A [`DocumentStore`] backed by the relational `documents` table, scoped
/// to one tenant through [`TenantContext`].
pub struct SqlDocumentStore {
    ctx: Arc<TenantContext>,
    user_id: String,
    project_id: String,
}

impl SqlDocumentStore {
    /// Binds a tenant context to one `(user_id, project_id)` pair.
    pub fn new(ctx: Arc<TenantContext>, user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        SqlDocumentStore {
            ctx,
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn read(&self, path: &str) -> CortexResult<String> {
        validate_path(path)?;
        let mut tx = self.ctx.scoped_tx(&self.user_id, &self.project_id).await?;
        let row: Option<String> = sqlx::query_scalar(
            "SELECT content FROM documents WHERE user_id = $1 AND project_id = $2 AND path = $3",
        )
        .bind(&self.user_id)
        .bind(&self.project_id)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        row.ok_or_else(|| CortexError::invalid_input(format!("document not found: {path}")))
    }

    async fn write(&self, path: &str, content: &str) -> CortexResult<()> {
        validate_path(path)?;
        let mut tx = self.ctx.scoped_tx(&self.user_id, &self.project_id).await?;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO documents (user_id, project_id, path, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (user_id, project_id, path) DO UPDATE SET
                content = EXCLUDED.content,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.user_id)
        .bind(&self.project_id)
        .bind(path)
        .bind(content)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CortexResult<Vec<String>> {
        let mut tx = self.ctx.scoped_tx(&self.user_id, &self.project_id).await?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT path FROM documents WHERE user_id = $1 AND project_id = $2 AND path LIKE $3 ORDER BY path",
        )
        .bind(&self.user_id)
        .bind(&self.project_id)
        .bind(&pattern)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        Ok(rows)
    }

    async fn is_dir(&self, _path: &str) -> CortexResult<bool> {
        // The table is a flat key-value map; a "directory" is just a path
        // prefix shared by several rows, never a row of its own.
        Ok(false)
    }

    async fn delete(&self, path: &str) -> CortexResult<()> {
        let mut tx = self.ctx.scoped_tx(&self.user_id, &self.project_id).await?;
        sqlx::query("DELETE FROM documents WHERE user_id = $1 AND project_id = $2 AND path = $3")
            .bind(&self.user_id)
            .bind(&self.project_id)
            .bind(path)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_path("../etc/passwd.md").is_err());
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(validate_path("/etc/passwd.md").is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(validate_path("notes.exe").is_err());
    }

    #[test]
    fn accepts_relative_markdown_path() {
        assert!(validate_path("docs/notes.md").is_ok());
    }

    #[tokio::test]
    async fn fs_store_round_trips_a_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        store.write("notes/a.md", "hello").await.unwrap();
        assert_eq!(store.read("notes/a.md").await.unwrap(), "hello");
        let listed = store.list("").await.unwrap();
        assert_eq!(listed, vec!["notes/a.md".to_string()]);
        store.delete("notes/a.md").await.unwrap();
        assert!(store.read("notes/a.md").await.is_err());
    }
}
