//! Adapts [`TenantContext`] into a standing [`GraphStore`], so collaborators
//! built once per session (a [`crate::TenantContext`]-unaware
//! `RetrievalEngine`, say) can hold an `Arc<dyn GraphStore>` without
//! knowing every call is actually opening and closing its own transaction
//! underneath.

use crate::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_graph_core::{CompactionReport, EntityRef, GraphStore, SearchOptions, SearchResults};
use cortexd_types::{
    CortexResult, Entity, EntityId, Observation, ObservationId, ObservationSource, Relation,
    Snapshot,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A [`GraphStore`] bound to one tenant for its whole lifetime. Every call
/// opens its own [`TenantContext::run`] transaction; nothing here is
/// cached or held open between calls.
pub struct TenantScopedGraphStore {
    ctx: Arc<TenantContext>,
    user_id: String,
    project_id: String,
}

impl TenantScopedGraphStore {
    /// Builds a store scoped to `(user_id, project_id)` over `ctx`.
    pub fn new(ctx: Arc<TenantContext>, user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        TenantScopedGraphStore {
            ctx,
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl GraphStore for TenantScopedGraphStore {
    async fn initialize(&self) -> CortexResult<()> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.initialize().await })
            .await
    }

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attrs: HashMap<String, Value>,
    ) -> CortexResult<Entity> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move {
                backend.upsert_entity(name, entity_type, attrs).await
            })
            .await
    }

    async fn add_observation(
        &self,
        entity_ref: EntityRef,
        text: &str,
        source: ObservationSource,
        timestamp: Option<DateTime<Utc>>,
    ) -> CortexResult<Observation> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move {
                backend.add_observation(entity_ref, text, source, timestamp).await
            })
            .await
    }

    async fn link_entities(&self, from: EntityRef, relation_type: &str, to: EntityRef) -> CortexResult<Relation> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move {
                backend.link_entities(from, relation_type, to).await
            })
            .await
    }

    async fn unlink_entities(&self, from: EntityRef, relation_type: &str, to: EntityRef) -> CortexResult<()> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move {
                backend.unlink_entities(from, relation_type, to).await
            })
            .await
    }

    async fn delete_entity(&self, entity_ref: EntityRef) -> CortexResult<()> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.delete_entity(entity_ref).await })
            .await
    }

    async fn delete_observation(&self, id: &ObservationId) -> CortexResult<()> {
        let id = id.clone();
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.delete_observation(&id).await })
            .await
    }

    async fn search(&self, query: &str, opts: SearchOptions) -> CortexResult<SearchResults> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.search(query, opts).await })
            .await
    }

    async fn expand(&self, seeds: &[EntityId], depth: u8) -> CortexResult<(Vec<Entity>, Vec<Relation>)> {
        let seeds = seeds.to_vec();
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.expand(&seeds, depth).await })
            .await
    }

    async fn snapshot(&self) -> CortexResult<Snapshot> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.snapshot().await })
            .await
    }

    async fn rebuild(&self) -> CortexResult<Snapshot> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.rebuild().await })
            .await
    }

    async fn compact(&self) -> CortexResult<CompactionReport> {
        self.ctx
            .run(&self.user_id, &self.project_id, |backend| async move { backend.compact().await })
            .await
    }
}
