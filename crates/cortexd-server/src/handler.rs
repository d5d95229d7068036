//! Turns a newly created session's tenant into a concrete `GraphStore` +
//! `RetrievalEngine` pair, and dispatches each submitted request against
//! them.

use crate::config::{BackendKind, ServerConfig};
use crate::rpc;
use async_trait::async_trait;
use cortexd_graph_core::GraphStore;
use cortexd_graph_file::FileBackend;
use cortexd_retrieval::{CoreDocumentSpec, DocumentStore, FsDocumentStore, RetrievalEngine, SqlDocumentStore};
use cortexd_tenant::{TenantContext, TenantScopedGraphStore};
use cortexd_transport::{SessionHandler, SessionHandlerFactory};
use cortexd_types::{CortexResult, Tenant};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Dispatches every request submitted on one session against a fixed
/// `(GraphStore, RetrievalEngine)` pair, both already scoped to the
/// session's tenant.
pub struct CortexSessionHandler {
    graph: Arc<dyn GraphStore>,
    retrieval: Arc<RetrievalEngine>,
}

#[async_trait]
impl SessionHandler for CortexSessionHandler {
    async fn handle(&self, request: Value) -> CortexResult<Vec<Value>> {
        let response = rpc::dispatch(self.graph.as_ref(), self.retrieval.as_ref(), request).await;
        Ok(vec![response])
    }
}

/// Builds a [`CortexSessionHandler`] for each newly created session,
/// choosing the file or relational backend per [`ServerConfig`].
pub struct CortexSessionHandlerFactory {
    backend: BackendKind,
    data_dir: PathBuf,
    tenant_context: Option<Arc<TenantContext>>,
    core_documents: Vec<CoreDocumentSpec>,
}

impl CortexSessionHandlerFactory {
    /// Builds a factory from `config`, reusing `tenant_context` for every
    /// relational-backend session (`None` when `config.backend` is `File`).
    pub fn new(config: &ServerConfig, tenant_context: Option<Arc<TenantContext>>) -> Self {
        CortexSessionHandlerFactory {
            backend: config.backend,
            data_dir: PathBuf::from(&config.data_dir),
            tenant_context,
            core_documents: Vec::new(),
        }
    }
}

#[async_trait]
impl SessionHandlerFactory for CortexSessionHandlerFactory {
    async fn build(&self, tenant: Tenant) -> CortexResult<Arc<dyn SessionHandler>> {
        let (graph, documents): (Arc<dyn GraphStore>, Arc<dyn DocumentStore>) = match self.backend {
            BackendKind::File => {
                let store_dir = self.data_dir.join(&tenant.user_id).join(&tenant.project_id);
                let store_id = format!("{}:{}", tenant.user_id, tenant.project_id);
                let graph = FileBackend::open(store_dir.clone(), store_id);
                graph.initialize().await?;
                let documents = FsDocumentStore::new(store_dir);
                (Arc::new(graph), Arc::new(documents))
            }
            BackendKind::Relational => {
                let ctx = self
                    .tenant_context
                    .clone()
                    .expect("relational backend requires a tenant context");
                let graph = TenantScopedGraphStore::new(ctx.clone(), tenant.user_id.as_str(), tenant.project_id.as_str());
                graph.initialize().await?;
                let documents = SqlDocumentStore::new(ctx, tenant.user_id.as_str(), tenant.project_id.as_str());
                (Arc::new(graph), Arc::new(documents))
            }
        };

        let retrieval = RetrievalEngine::new(graph.clone(), documents, self.core_documents.clone());
        Ok(Arc::new(CortexSessionHandler { graph, retrieval: Arc::new(retrieval) }))
    }
}
