#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-graph-sql** – the Postgres-backed [`GraphStore`]. Each
//! `(user_id, project_id)` pair owns its own event log and projection rows,
//! isolated by row-level security policies that read two `SET LOCAL`-style
//! session variables set once per transaction via `set_config` (a function
//! call, never string-interpolated SQL).
//!
//! A [`RelationalBackend`] is cheap to construct and meant to be scoped to
//! exactly one tenant for the lifetime of one request — constructing one
//! outside `cortexd_tenant::TenantContext::run` bypasses that guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_graph_core::{
    expand, minimal_events, CompactionReport, EntityRef, EventLog, Generation, GraphStore,
    SearchOptions, SearchResults, SnapshotCache,
};
use cortexd_types::{
    normalize, CortexError, CortexResult, Entity, EntityId, GraphEvent, Observation,
    ObservationId, ObservationSource, Relation, RelationId, Snapshot, SnapshotMeta, Tenant,
};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

fn sql_err(err: sqlx::Error) -> CortexError {
    CortexError::IoError(format!("postgres error: {err}"))
}

/// Creates the tenant-scoped tables and their row-level security policies if
/// they don't already exist. Idempotent; call once at service startup
/// against the shared pool, not per tenant.
pub async fn ensure_schema(pool: &PgPool) -> CortexResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_events (
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            seq BIGSERIAL NOT NULL,
            event JSONB NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, project_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_entities (
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            attrs JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, project_id, id),
            UNIQUE (user_id, project_id, normalized_name)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_observations (
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            text TEXT NOT NULL,
            source JSONB NOT NULL,
            observed_at TIMESTAMPTZ NOT NULL,
            fts_vector tsvector GENERATED ALWAYS AS (to_tsvector('english', text)) STORED,
            PRIMARY KEY (user_id, project_id, id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_graph_observations_fts ON graph_observations USING GIN (fts_vector)",
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_relations (
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            id TEXT NOT NULL,
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, project_id, id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(sql_err)?;

    for table in ["graph_events", "graph_entities", "graph_observations", "graph_relations"] {
        sqlx::query(&format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"))
            .execute(pool)
            .await
            .map_err(sql_err)?;
        // Table owners bypass RLS unless forced — without this a migration
        // run by the owning role would silently see every tenant's rows.
        sqlx::query(&format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"))
            .execute(pool)
            .await
            .map_err(sql_err)?;

        let policy = format!(
            "CREATE POLICY tenant_isolation ON {table} \
             USING (user_id = current_setting('app.current_user_id', true) \
                AND project_id = current_setting('app.current_project_id', true)) \
             WITH CHECK (user_id = current_setting('app.current_user_id', true) \
                AND project_id = current_setting('app.current_project_id', true))"
        );
        if let Err(err) = sqlx::query(&policy).execute(pool).await {
            if !err.to_string().contains("already exists") {
                return Err(sql_err(err));
            }
        }
    }

    Ok(())
}

/// A single tenant's view onto the shared Postgres pool. Every method opens
/// its own transaction, sets the two RLS session variables, and commits
/// before returning — a held-open, request-spanning instance would let the
/// session variables leak onto an unrelated later query on the same
/// connection, so don't cache one.
pub struct RelationalBackend {
    pool: PgPool,
    tenant: Tenant,
    cache: RwLock<SnapshotCache>,
}

impl RelationalBackend {
    /// Binds a pool to one tenant. Constructed once per request inside
    /// `cortexd_tenant::TenantContext::run`.
    pub fn new(pool: PgPool, tenant: Tenant) -> Self {
        RelationalBackend {
            pool,
            tenant,
            cache: RwLock::new(SnapshotCache::new()),
        }
    }

    /// The tenant this backend is scoped to.
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    async fn scoped_tx(&self) -> CortexResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("SELECT set_config('app.current_user_id', $1, true)")
            .bind(&self.tenant.user_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        sqlx::query("SELECT set_config('app.current_project_id', $1, true)")
            .bind(&self.tenant.project_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        Ok(tx)
    }

    async fn resolve_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity_ref: EntityRef,
    ) -> CortexResult<EntityId> {
        match entity_ref {
            EntityRef::Id(id) => {
                let row = sqlx::query(
                    "SELECT 1 FROM graph_entities WHERE user_id = $1 AND project_id = $2 AND id = $3",
                )
                .bind(&self.tenant.user_id)
                .bind(&self.tenant.project_id)
                .bind(id.as_str())
                .fetch_optional(&mut **tx)
                .await
                .map_err(sql_err)?;
                if row.is_some() {
                    Ok(id)
                } else {
                    Err(CortexError::entity_not_found(id.to_string()))
                }
            }
            EntityRef::Name(name) => {
                let normalized = normalize(&name);
                let row = sqlx::query(
                    "SELECT id FROM graph_entities WHERE user_id = $1 AND project_id = $2 AND normalized_name = $3",
                )
                .bind(&self.tenant.user_id)
                .bind(&self.tenant.project_id)
                .bind(&normalized)
                .fetch_optional(&mut **tx)
                .await
                .map_err(sql_err)?;
                match row {
                    Some(row) => Ok(EntityId::from_raw(row.get::<String, _>("id"))),
                    None => Err(CortexError::entity_not_found(name)),
                }
            }
        }
    }

    async fn byte_size(&self, tx: &mut Transaction<'_, Postgres>) -> CortexResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(pg_column_size(event)), 0) AS bytes FROM graph_events WHERE user_id = $1 AND project_id = $2",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(sql_err)?;
        let bytes: i64 = row.get("bytes");
        Ok(bytes as u64)
    }

    async fn build_snapshot(&self, generation: Generation) -> CortexResult<Snapshot> {
        let mut tx = self.scoped_tx().await?;
        let entity_rows = sqlx::query(
            "SELECT id, name, entity_type, attrs, created_at, updated_at FROM graph_entities WHERE user_id = $1 AND project_id = $2",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        let observation_rows = sqlx::query(
            "SELECT id, entity_id, text, source, observed_at FROM graph_observations WHERE user_id = $1 AND project_id = $2",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        let relation_rows = sqlx::query(
            "SELECT id, from_id, to_id, relation_type, created_at FROM graph_relations WHERE user_id = $1 AND project_id = $2",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;

        let mut snapshot = Snapshot::empty(format!("{}:{}", self.tenant.user_id, self.tenant.project_id));
        snapshot.meta = SnapshotMeta {
            store_type: GraphEvent::MARKER_SOURCE.to_string(),
            version: GraphEvent::MARKER_VERSION.to_string(),
            store_id: snapshot.meta.store_id.clone(),
            created_at: Utc::now(),
            source: "relational".to_string(),
        };
        for row in &entity_rows {
            let entity = row_to_entity(row)?;
            snapshot.entities.insert(entity.id.clone(), entity);
        }
        for row in &observation_rows {
            let obs = row_to_observation(row)?;
            snapshot.observations.insert(obs.id.clone(), obs);
        }
        for row in &relation_rows {
            let rel = row_to_relation(row)?;
            snapshot.relations.insert(rel.id.clone(), rel);
        }

        self.cache.write().await.store(generation, snapshot.clone());
        Ok(snapshot)
    }
}

fn row_to_entity(row: &PgRow) -> CortexResult<Entity> {
    let attrs_json: Value = row.try_get("attrs").map_err(sql_err)?;
    let attrs: HashMap<String, Value> = match attrs_json {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    Ok(Entity {
        id: EntityId::from_raw(row.try_get::<String, _>("id").map_err(sql_err)?),
        name: row.try_get("name").map_err(sql_err)?,
        entity_type: row.try_get("entity_type").map_err(sql_err)?,
        attrs,
        created_at: row.try_get("created_at").map_err(sql_err)?,
        updated_at: row.try_get("updated_at").map_err(sql_err)?,
    })
}

fn row_to_observation(row: &PgRow) -> CortexResult<Observation> {
    let source_json: Value = row.try_get("source").map_err(sql_err)?;
    let source: ObservationSource = serde_json::from_value(source_json)?;
    Ok(Observation {
        id: ObservationId::from_raw(row.try_get::<String, _>("id").map_err(sql_err)?),
        entity_id: EntityId::from_raw(row.try_get::<String, _>("entity_id").map_err(sql_err)?),
        text: row.try_get("text").map_err(sql_err)?,
        source,
        timestamp: row.try_get("observed_at").map_err(sql_err)?,
    })
}

fn row_to_relation(row: &PgRow) -> CortexResult<Relation> {
    Ok(Relation {
        id: RelationId::from_raw(row.try_get::<String, _>("id").map_err(sql_err)?),
        from_id: EntityId::from_raw(row.try_get::<String, _>("from_id").map_err(sql_err)?),
        to_id: EntityId::from_raw(row.try_get::<String, _>("to_id").map_err(sql_err)?),
        relation_type: row.try_get("relation_type").map_err(sql_err)?,
        created_at: row.try_get("created_at").map_err(sql_err)?,
    })
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    tenant: &Tenant,
    event: &GraphEvent,
) -> CortexResult<()> {
    let payload = serde_json::to_value(event)?;
    sqlx::query("INSERT INTO graph_events (user_id, project_id, event, recorded_at) VALUES ($1, $2, $3, $4)")
        .bind(&tenant.user_id)
        .bind(&tenant.project_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(sql_err)?;
    Ok(())
}

/// Mirrors the reducer's fold rules as direct SQL mutations against the
/// projection tables, inside the same transaction as the event's own
/// insert — projections and log can never drift apart. Callers that build
/// an `EntityUpsert` are expected to have already merged `attrs` against
/// any existing row (see `RelationalBackend::upsert_entity`); this
/// function just replaces the row with whatever the event carries.
async fn apply_projection(
    tx: &mut Transaction<'_, Postgres>,
    tenant: &Tenant,
    event: &GraphEvent,
) -> CortexResult<()> {
    match event {
        GraphEvent::Marker { .. } | GraphEvent::SnapshotWritten { .. } => {}
        GraphEvent::EntityUpsert {
            id,
            name,
            entity_type,
            attrs,
            ts,
        } => {
            let normalized = normalize(name);
            let attrs_json = serde_json::to_value(attrs)?;
            sqlx::query(
                r#"
                INSERT INTO graph_entities
                    (user_id, project_id, id, name, normalized_name, entity_type, attrs, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                ON CONFLICT (user_id, project_id, id) DO UPDATE SET
                    name = EXCLUDED.name,
                    normalized_name = EXCLUDED.normalized_name,
                    entity_type = EXCLUDED.entity_type,
                    attrs = EXCLUDED.attrs,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&tenant.user_id)
            .bind(&tenant.project_id)
            .bind(id.as_str())
            .bind(name)
            .bind(&normalized)
            .bind(entity_type)
            .bind(attrs_json)
            .bind(ts)
            .execute(&mut **tx)
            .await
            .map_err(sql_err)?;
        }
        GraphEvent::ObservationAdd {
            id,
            entity_id,
            text,
            source,
            ts,
        } => {
            let source_json = serde_json::to_value(source)?;
            sqlx::query(
                r#"
                INSERT INTO graph_observations
                    (user_id, project_id, id, entity_id, text, source, observed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, project_id, id) DO NOTHING
                "#,
            )
            .bind(&tenant.user_id)
            .bind(&tenant.project_id)
            .bind(id.as_str())
            .bind(entity_id.as_str())
            .bind(text)
            .bind(source_json)
            .bind(ts)
            .execute(&mut **tx)
            .await
            .map_err(sql_err)?;
        }
        GraphEvent::RelationAdd {
            id,
            from_id,
            to_id,
            relation_type,
            ts,
        } => {
            sqlx::query(
                r#"
                INSERT INTO graph_relations
                    (user_id, project_id, id, from_id, to_id, relation_type, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, project_id, id) DO NOTHING
                "#,
            )
            .bind(&tenant.user_id)
            .bind(&tenant.project_id)
            .bind(id.as_str())
            .bind(from_id.as_str())
            .bind(to_id.as_str())
            .bind(relation_type)
            .bind(ts)
            .execute(&mut **tx)
            .await
            .map_err(sql_err)?;
        }
        GraphEvent::RelationRemove { id, .. } => {
            sqlx::query("DELETE FROM graph_relations WHERE user_id = $1 AND project_id = $2 AND id = $3")
                .bind(&tenant.user_id)
                .bind(&tenant.project_id)
                .bind(id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(sql_err)?;
        }
        GraphEvent::EntityDelete { id, .. } => {
            sqlx::query("DELETE FROM graph_entities WHERE user_id = $1 AND project_id = $2 AND id = $3")
                .bind(&tenant.user_id)
                .bind(&tenant.project_id)
                .bind(id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(sql_err)?;
            sqlx::query(
                "DELETE FROM graph_observations WHERE user_id = $1 AND project_id = $2 AND entity_id = $3",
            )
            .bind(&tenant.user_id)
            .bind(&tenant.project_id)
            .bind(id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(sql_err)?;
            sqlx::query(
                "DELETE FROM graph_relations WHERE user_id = $1 AND project_id = $2 AND (from_id = $3 OR to_id = $3)",
            )
            .bind(&tenant.user_id)
            .bind(&tenant.project_id)
            .bind(id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(sql_err)?;
        }
        GraphEvent::ObservationDelete { id, .. } => {
            sqlx::query("DELETE FROM graph_observations WHERE user_id = $1 AND project_id = $2 AND id = $3")
                .bind(&tenant.user_id)
                .bind(&tenant.project_id)
                .bind(id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(sql_err)?;
        }
    }
    Ok(())
}

#[async_trait]
impl EventLog for RelationalBackend {
    async fn append(&self, event: GraphEvent) -> CortexResult<()> {
        let mut tx = self.scoped_tx().await?;
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn read_all(&self) -> CortexResult<Vec<GraphEvent>> {
        let mut tx = self.scoped_tx().await?;
        let rows = sqlx::query(
            "SELECT event FROM graph_events WHERE user_id = $1 AND project_id = $2 ORDER BY seq ASC",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = row.try_get("event").map_err(sql_err)?;
            match serde_json::from_value::<GraphEvent>(value) {
                Ok(event) => events.push(event),
                Err(err) => tracing::warn!(error = %err, "skipping malformed stored event"),
            }
        }
        Ok(events)
    }

    async fn truncate_and_replace(&self, events: Vec<GraphEvent>) -> CortexResult<()> {
        let mut tx = self.scoped_tx().await?;
        sqlx::query("DELETE FROM graph_events WHERE user_id = $1 AND project_id = $2")
            .bind(&self.tenant.user_id)
            .bind(&self.tenant.project_id)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        for event in &events {
            insert_event(&mut tx, &self.tenant, event).await?;
        }
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn generation(&self) -> CortexResult<Generation> {
        let mut tx = self.scoped_tx().await?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS max_seq FROM graph_events WHERE user_id = $1 AND project_id = $2",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        let max_seq: i64 = row.get("max_seq");
        Ok(Generation(max_seq as u64))
    }
}

#[async_trait]
impl GraphStore for RelationalBackend {
    async fn initialize(&self) -> CortexResult<()> {
        let events = self.read_all().await?;
        if events.is_empty() {
            self.append(GraphEvent::marker()).await?;
        } else {
            match events.first() {
                Some(GraphEvent::Marker { source, version })
                    if source == GraphEvent::MARKER_SOURCE && version == GraphEvent::MARKER_VERSION => {}
                _ => {
                    return Err(CortexError::MarkerMismatch(
                        "tenant event log has no valid marker at position 0".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attrs: HashMap<String, Value>,
    ) -> CortexResult<Entity> {
        if name.trim().is_empty() || entity_type.trim().is_empty() {
            return Err(CortexError::invalid_input("name and entity_type must be non-empty"));
        }
        if !cortexd_types::attrs_within_depth(&attrs) {
            return Err(CortexError::invalid_input("attrs nested too deeply"));
        }

        let id = EntityId::derive(name, entity_type);
        let mut tx = self.scoped_tx().await?;
        let existing: Option<(DateTime<Utc>, Value)> = sqlx::query_as(
            "SELECT created_at, attrs FROM graph_entities WHERE user_id = $1 AND project_id = $2 AND id = $3",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_err)?;

        let now = Utc::now();
        let created_at = existing.as_ref().map(|(ts, _)| *ts).unwrap_or(now);

        // Shallow union: start from the existing attrs, then let the
        // caller's keys win. entity_type always replaces, per upsert
        // semantics.
        let mut merged_attrs: HashMap<String, Value> = match existing.map(|(_, attrs)| attrs) {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        merged_attrs.extend(attrs);

        let event = GraphEvent::EntityUpsert {
            id: id.clone(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            attrs: merged_attrs.clone(),
            ts: now,
        };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();

        Ok(Entity {
            id,
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            attrs: merged_attrs,
            created_at,
            updated_at: now,
        })
    }

    async fn add_observation(
        &self,
        entity_ref: EntityRef,
        text: &str,
        source: ObservationSource,
        timestamp: Option<DateTime<Utc>>,
    ) -> CortexResult<Observation> {
        if text.trim().is_empty() {
            return Err(CortexError::invalid_input("observation text must be non-empty"));
        }
        let mut tx = self.scoped_tx().await?;
        let entity_id = self.resolve_in(&mut tx, entity_ref).await?;
        let ts = timestamp.unwrap_or_else(Utc::now);
        let id = ObservationId::derive(&entity_id, text, ts);

        let event = GraphEvent::ObservationAdd {
            id: id.clone(),
            entity_id: entity_id.clone(),
            text: text.to_string(),
            source: source.clone(),
            ts,
        };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();

        Ok(Observation {
            id,
            entity_id,
            text: text.to_string(),
            source,
            timestamp: ts,
        })
    }

    async fn link_entities(
        &self,
        from: EntityRef,
        relation_type: &str,
        to: EntityRef,
    ) -> CortexResult<Relation> {
        if relation_type.trim().is_empty() {
            return Err(CortexError::invalid_input("relation_type must be non-empty"));
        }
        let mut tx = self.scoped_tx().await?;
        let from_id = self.resolve_in(&mut tx, from).await?;
        let to_id = self.resolve_in(&mut tx, to).await?;
        let id = RelationId::derive(&from_id, &to_id, relation_type);

        let existing = sqlx::query(
            "SELECT created_at FROM graph_relations WHERE user_id = $1 AND project_id = $2 AND id = $3",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_err)?;

        if let Some(row) = existing {
            let created_at: DateTime<Utc> = row.get("created_at");
            tx.commit().await.map_err(sql_err)?;
            return Ok(Relation {
                id,
                from_id,
                to_id,
                relation_type: relation_type.to_string(),
                created_at,
            });
        }

        let now = Utc::now();
        let event = GraphEvent::RelationAdd {
            id: id.clone(),
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            relation_type: relation_type.to_string(),
            ts: now,
        };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();

        Ok(Relation {
            id,
            from_id,
            to_id,
            relation_type: relation_type.to_string(),
            created_at: now,
        })
    }

    async fn unlink_entities(
        &self,
        from: EntityRef,
        relation_type: &str,
        to: EntityRef,
    ) -> CortexResult<()> {
        let mut tx = self.scoped_tx().await?;
        let from_id = match self.resolve_in(&mut tx, from).await {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };
        let to_id = match self.resolve_in(&mut tx, to).await {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };
        let id = RelationId::derive(&from_id, &to_id, relation_type);

        let exists = sqlx::query(
            "SELECT 1 FROM graph_relations WHERE user_id = $1 AND project_id = $2 AND id = $3",
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql_err)?;
        if exists.is_none() {
            return Ok(());
        }

        let event = GraphEvent::RelationRemove { id, ts: Utc::now() };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn delete_entity(&self, entity_ref: EntityRef) -> CortexResult<()> {
        let mut tx = self.scoped_tx().await?;
        let id = self.resolve_in(&mut tx, entity_ref).await?;
        let event = GraphEvent::EntityDelete { id, ts: Utc::now() };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn delete_observation(&self, id: &ObservationId) -> CortexResult<()> {
        let mut tx = self.scoped_tx().await?;
        let event = GraphEvent::ObservationDelete {
            id: id.clone(),
            ts: Utc::now(),
        };
        insert_event(&mut tx, &self.tenant, &event).await?;
        apply_projection(&mut tx, &self.tenant, &event).await?;
        tx.commit().await.map_err(sql_err)?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn search(&self, query: &str, opts: SearchOptions) -> CortexResult<SearchResults> {
        let mut tx = self.scoped_tx().await?;
        let normalized_query = normalize(query);
        let like_pattern = format!(
            "%{}%",
            normalized_query.replace('%', "\\%").replace('_', "\\_")
        );

        let entity_rows = sqlx::query(
            r#"
            SELECT id, name, entity_type, attrs, created_at, updated_at,
                CASE
                    WHEN normalized_name = $3 THEN 1.0
                    WHEN normalized_name LIKE $4 THEN 0.8
                    WHEN lower(entity_type) LIKE $4 THEN 0.5
                    ELSE 0.3
                END AS score
            FROM graph_entities
            WHERE user_id = $1 AND project_id = $2
              AND (normalized_name LIKE $4 OR lower(entity_type) LIKE $4 OR attrs::text ILIKE $4)
            ORDER BY score DESC, name ASC
            LIMIT $5
            "#,
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .bind(&normalized_query)
        .bind(&like_pattern)
        .bind(opts.limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;

        let entities: Vec<Entity> = entity_rows
            .iter()
            .map(row_to_entity)
            .collect::<CortexResult<_>>()?;
        let scoped_ids: HashSet<EntityId> = entities.iter().map(|e| e.id.clone()).collect();

        let observation_rows = sqlx::query(
            r#"
            SELECT id, entity_id, text, source, observed_at
            FROM graph_observations
            WHERE user_id = $1 AND project_id = $2 AND fts_vector @@ plainto_tsquery('english', $3)
            ORDER BY ts_rank(fts_vector, plainto_tsquery('english', $3)) DESC, observed_at DESC
            LIMIT $4
            "#,
        )
        .bind(&self.tenant.user_id)
        .bind(&self.tenant.project_id)
        .bind(query)
        .bind(opts.limit.min(50) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(sql_err)?;
        let observations: Vec<Observation> = observation_rows
            .iter()
            .map(row_to_observation)
            .collect::<CortexResult<_>>()?;

        let relation_rows = if scoped_ids.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<String> = scoped_ids.iter().map(|id| id.as_str().to_string()).collect();
            sqlx::query(
                r#"
                SELECT id, from_id, to_id, relation_type, created_at
                FROM graph_relations
                WHERE user_id = $1 AND project_id = $2
                  AND lower(relation_type) LIKE $3
                  AND from_id = ANY($4) AND to_id = ANY($4)
                "#,
            )
            .bind(&self.tenant.user_id)
            .bind(&self.tenant.project_id)
            .bind(&like_pattern)
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(sql_err)?
        };
        let relations: Vec<Relation> = relation_rows
            .iter()
            .map(row_to_relation)
            .collect::<CortexResult<_>>()?;

        tx.commit().await.map_err(sql_err)?;
        Ok(SearchResults {
            entities,
            observations,
            relations,
        })
    }

    async fn expand(
        &self,
        seeds: &[EntityId],
        depth: u8,
    ) -> CortexResult<(Vec<Entity>, Vec<Relation>)> {
        let snapshot = self.snapshot().await?;
        Ok(expand(&snapshot, seeds, depth))
    }

    async fn snapshot(&self) -> CortexResult<Snapshot> {
        let generation = EventLog::generation(self).await?;
        if let Some(snapshot) = self.cache.read().await.get(generation) {
            return Ok(snapshot.clone());
        }
        self.build_snapshot(generation).await
    }

    async fn rebuild(&self) -> CortexResult<Snapshot> {
        let generation = EventLog::generation(self).await?;
        self.build_snapshot(generation).await
    }

    async fn compact(&self) -> CortexResult<CompactionReport> {
        let before_bytes = {
            let mut tx = self.scoped_tx().await?;
            let bytes = self.byte_size(&mut tx).await?;
            tx.commit().await.map_err(sql_err)?;
            bytes
        };

        let snapshot = self.rebuild().await?;
        let minimal = minimal_events(&snapshot);
        self.truncate_and_replace(minimal).await?;

        let after_bytes = {
            let mut tx = self.scoped_tx().await?;
            let bytes = self.byte_size(&mut tx).await?;
            tx.commit().await.map_err(sql_err)?;
            bytes
        };

        Ok(CompactionReport {
            before_bytes,
            after_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortexd_graph_core::GraphStore as _;

    /// Live Postgres integration tests are opt-in: set
    /// `CORTEXD_TEST_DATABASE_URL` to run them, otherwise they no-op so the
    /// suite stays green without a database on hand.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("CORTEXD_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to test database");
        ensure_schema(&pool).await.expect("migrate test schema");
        Some(pool)
    }

    fn tenant(user: &str, project: &str) -> Tenant {
        Tenant {
            user_id: user.to_string(),
            project_id: project.to_string(),
        }
    }

    #[tokio::test]
    async fn scenario_a_append_reduce_round_trip() {
        let Some(pool) = test_pool().await else { return };
        let backend = RelationalBackend::new(pool, tenant("u1", "p1"));
        backend.initialize().await.unwrap();
        backend
            .upsert_entity("Alice", "person", HashMap::new())
            .await
            .unwrap();
        backend
            .upsert_entity("Project X", "project", HashMap::new())
            .await
            .unwrap();
        backend
            .link_entities("Alice".into(), "works_on", "Project X".into())
            .await
            .unwrap();

        let snapshot = backend.snapshot().await.unwrap();
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.relations.len(), 1);
    }

    #[tokio::test]
    async fn scenario_e_tenant_isolation() {
        let Some(pool) = test_pool().await else { return };
        let backend_a = RelationalBackend::new(pool.clone(), tenant("u1", "p-iso-a"));
        let backend_b = RelationalBackend::new(pool, tenant("u1", "p-iso-b"));
        backend_a.initialize().await.unwrap();
        backend_b.initialize().await.unwrap();

        backend_a
            .upsert_entity("Secret", "thing", HashMap::new())
            .await
            .unwrap();

        let snapshot_b = backend_b.snapshot().await.unwrap();
        assert!(snapshot_b.entities.is_empty());
    }
}
