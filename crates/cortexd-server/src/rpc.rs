//! Translates one submitted JSON-RPC-shaped request into a call against a
//! tenant's `GraphStore`/`RetrievalEngine`, and its result back into the
//! `{ok, value} | {err, kind, message}` envelope.

use chrono::{DateTime, Utc};
use cortexd_graph_core::{EntityRef, GraphStore, SearchOptions};
use cortexd_retrieval::{RetrievalEngine, RetrievalOptions};
use cortexd_types::{CortexError, CortexResult, EntityId, ObservationId, ObservationSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// One submitted request: a method name, its parameters, and an opaque id
/// echoed back on the response so the caller can correlate it.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

/// Dispatches `request` against `graph` and `retrieval`, producing the
/// single response envelope to deliver back over the session's event
/// stream.
pub async fn dispatch(graph: &dyn GraphStore, retrieval: &RetrievalEngine, request: Value) -> Value {
    let request: RpcRequest = match serde_json::from_value(request) {
        Ok(request) => request,
        Err(err) => return err_envelope(Value::Null, &CortexError::invalid_input(err.to_string())),
    };
    let id = request.id.clone();
    match run(graph, retrieval, &request.method, request.params).await {
        Ok(value) => ok_envelope(id, value),
        Err(err) => err_envelope(id, &err),
    }
}

fn ok_envelope(id: Value, value: Value) -> Value {
    json!({"id": id, "ok": true, "value": value})
}

fn err_envelope(id: Value, err: &CortexError) -> Value {
    json!({"id": id, "ok": false, "kind": err.kind(), "message": err.to_string()})
}

fn parse_entity_ref(raw: &str) -> EntityRef {
    if raw.starts_with("ent_") {
        EntityRef::Id(EntityId::from_raw(raw))
    } else {
        EntityRef::Name(raw.to_string())
    }
}

fn params_of<T: for<'de> Deserialize<'de>>(params: Value) -> CortexResult<T> {
    serde_json::from_value(params).map_err(|err| CortexError::invalid_input(err.to_string()))
}

#[derive(Deserialize)]
struct UpsertEntityParams {
    name: String,
    entity_type: String,
    #[serde(default)]
    attrs: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct AddObservationParams {
    entity_ref: String,
    text: String,
    #[serde(default)]
    source: Option<ObservationSource>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LinkEntitiesParams {
    from: String,
    relation_type: String,
    to: String,
}

#[derive(Deserialize)]
struct EntityRefParams {
    entity_ref: String,
}

#[derive(Deserialize)]
struct ObservationIdParams {
    id: String,
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ExpandParams {
    seeds: Vec<String>,
    depth: u8,
}

#[derive(Deserialize)]
struct RetrieveParams {
    query: String,
    #[serde(default)]
    max_chars: Option<usize>,
}

async fn run(graph: &dyn GraphStore, retrieval: &RetrievalEngine, method: &str, params: Value) -> CortexResult<Value> {
    match method {
        "initialize" => {
            graph.initialize().await?;
            Ok(Value::Null)
        }
        "upsertEntity" => {
            let p: UpsertEntityParams = params_of(params)?;
            let entity = graph.upsert_entity(&p.name, &p.entity_type, p.attrs).await?;
            Ok(serde_json::to_value(entity).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "addObservation" => {
            let p: AddObservationParams = params_of(params)?;
            let observation = graph
                .add_observation(
                    parse_entity_ref(&p.entity_ref),
                    &p.text,
                    p.source.unwrap_or_default(),
                    p.timestamp,
                )
                .await?;
            Ok(serde_json::to_value(observation).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "linkEntities" => {
            let p: LinkEntitiesParams = params_of(params)?;
            let relation = graph
                .link_entities(parse_entity_ref(&p.from), &p.relation_type, parse_entity_ref(&p.to))
                .await?;
            Ok(serde_json::to_value(relation).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "unlinkEntities" => {
            let p: LinkEntitiesParams = params_of(params)?;
            graph
                .unlink_entities(parse_entity_ref(&p.from), &p.relation_type, parse_entity_ref(&p.to))
                .await?;
            Ok(Value::Null)
        }
        "deleteEntity" => {
            let p: EntityRefParams = params_of(params)?;
            graph.delete_entity(parse_entity_ref(&p.entity_ref)).await?;
            Ok(Value::Null)
        }
        "deleteObservation" => {
            let p: ObservationIdParams = params_of(params)?;
            graph.delete_observation(&ObservationId::from_raw(p.id)).await?;
            Ok(Value::Null)
        }
        "search" => {
            let p: SearchParams = params_of(params)?;
            let mut opts = SearchOptions::default();
            if let Some(limit) = p.limit {
                opts.limit = limit;
            }
            let results = graph.search(&p.query, opts).await?;
            Ok(serde_json::to_value(results).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "expand" => {
            let p: ExpandParams = params_of(params)?;
            let seeds: Vec<EntityId> = p.seeds.into_iter().map(EntityId::from_raw).collect();
            let (entities, relations) = graph.expand(&seeds, p.depth).await?;
            Ok(json!({"entities": entities, "relations": relations}))
        }
        "snapshot" => {
            let snapshot = graph.snapshot().await?;
            Ok(serde_json::to_value(snapshot).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "rebuild" => {
            let snapshot = graph.rebuild().await?;
            Ok(serde_json::to_value(snapshot).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        "compact" => {
            let report = graph.compact().await?;
            Ok(json!({"before_bytes": report.before_bytes, "after_bytes": report.after_bytes}))
        }
        "retrieveContext" => {
            let p: RetrieveParams = params_of(params)?;
            let mut opts = RetrievalOptions::default();
            if let Some(max_chars) = p.max_chars {
                opts.max_chars = max_chars;
            }
            let pack = retrieval.retrieve(&p.query, opts).await?;
            Ok(serde_json::to_value(pack).map_err(|err| CortexError::invalid_input(err.to_string()))?)
        }
        other => Err(CortexError::invalid_input(format!("unknown method: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_with_prefix_resolves_by_id() {
        assert!(matches!(parse_entity_ref("ent_abc123"), EntityRef::Id(_)));
    }

    #[test]
    fn entity_ref_without_prefix_resolves_by_name() {
        assert!(matches!(parse_entity_ref("Alice"), EntityRef::Name(_)));
    }

    #[tokio::test]
    async fn unknown_method_is_an_invalid_input_error() {
        use cortexd_graph_file::FileBackend;
        use cortexd_retrieval::{DocumentStore, FsDocumentStore};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let graph = FileBackend::open(dir.path(), "test-store");
        graph.initialize().await.unwrap();
        let documents: Arc<dyn DocumentStore> = Arc::new(FsDocumentStore::new(dir.path()));
        let retrieval = RetrievalEngine::new(Arc::new(graph), documents, vec![]);

        let request = json!({"method": "nonsense", "params": {}, "id": 1});
        let graph2 = FileBackend::open(dir.path(), "test-store");
        let response = dispatch(&graph2, &retrieval, request).await;
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["kind"], json!("invalid_input"));
    }
}
