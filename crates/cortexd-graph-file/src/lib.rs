#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-graph-file** – a [`GraphStore`] backed by a plain directory:
//! `graph.jsonl` (the event log), `graph.snapshot.json`, `graph.index.json`,
//! and a best-effort `graph.md` human-readable view.
//!
//! Append is read-existing-bytes + write-temp-file + rename, so a reader
//! never observes a half-written log: either the old content or the new
//! content, never a mix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortexd_graph_core::{
    expand, fold, minimal_events, search_entities, search_observations, search_relations,
    CompactionReport, EntityRef, EventLog, Generation, GraphStore, SearchOptions, SearchResults,
    SnapshotCache,
};
use cortexd_types::{
    normalize, CortexError, CortexResult, Entity, EntityId, GraphEvent, GraphIndex, Observation,
    ObservationId, ObservationSource, Relation, Snapshot,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

const LOG_FILE: &str = "graph.jsonl";
const SNAPSHOT_FILE: &str = "graph.snapshot.json";
const INDEX_FILE: &str = "graph.index.json";
const MARKDOWN_FILE: &str = "graph.md";

/// A [`GraphStore`] rooted at one directory on disk.
pub struct FileBackend {
    dir: PathBuf,
    store_id: String,
    /// Serializes appends and compactions — at most one write in flight.
    write_lock: Mutex<()>,
    cache: RwLock<SnapshotCache>,
}

impl FileBackend {
    /// Opens (without yet validating) a store rooted at `dir`. Call
    /// [`GraphStore::initialize`] before using it.
    pub fn open(dir: impl Into<PathBuf>, store_id: impl Into<String>) -> Self {
        FileBackend {
            dir: dir.into(),
            store_id: store_id.into(),
            write_lock: Mutex::new(()),
            cache: RwLock::new(SnapshotCache::new()),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn markdown_path(&self) -> PathBuf {
        self.dir.join(MARKDOWN_FILE)
    }

    /// Writes `contents` to `path` via a temp file in the same directory
    /// followed by a rename, so a reader never sees a partial write.
    async fn atomic_write(path: &Path, contents: &[u8]) -> CortexResult<()> {
        let dir = path.parent().ok_or_else(|| {
            CortexError::IoError("target path has no parent directory".to_string())
        })?;
        tokio::fs::create_dir_all(dir).await?;
        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("write"),
            uuid_like_suffix()
        ));
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_lines(&self) -> CortexResult<Vec<String>> {
        match tokio::fs::read_to_string(self.log_path()).await {
            Ok(contents) => Ok(contents.lines().map(|l| l.to_string()).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Parses stored lines into events, skipping and warning on any record
    /// that doesn't parse — a partially written tail or a hand-edited
    /// corrupt line must never poison the whole graph.
    fn parse_events(lines: &[String]) -> Vec<GraphEvent> {
        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<GraphEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(index, error = %err, "skipping malformed graph event record");
                }
            }
        }
        events
    }

    async fn current_snapshot(&self) -> CortexResult<Snapshot> {
        let lines = self.read_lines().await?;
        let generation = Generation(lines.len() as u64);
        if let Some(snapshot) = self.cache.read().await.get(generation) {
            return Ok(snapshot.clone());
        }
        self.rebuild_with_lines(lines, generation).await
    }

    async fn rebuild_with_lines(
        &self,
        lines: Vec<String>,
        generation: Generation,
    ) -> CortexResult<Snapshot> {
        let events = Self::parse_events(&lines);
        let (snapshot, warnings) = fold(&self.store_id, &events)?;
        for warning in &warnings {
            tracing::warn!(index = warning.index, message = %warning.message, "reducer warning");
        }

        if let Err(err) = self.write_materialized_views(&snapshot, lines.len() as u64).await {
            tracing::warn!(error = %err, "best-effort snapshot/index/markdown materialization failed");
        }

        self.cache.write().await.store(generation, snapshot.clone());
        Ok(snapshot)
    }

    async fn write_materialized_views(
        &self,
        snapshot: &Snapshot,
        last_event_line_count: u64,
    ) -> CortexResult<()> {
        let snapshot_bytes = serde_json::to_vec_pretty(snapshot)?;
        Self::atomic_write(&self.snapshot_path(), &snapshot_bytes).await?;

        let index = GraphIndex::build(snapshot, last_event_line_count);
        let index_bytes = serde_json::to_vec_pretty(&index)?;
        Self::atomic_write(&self.index_path(), &index_bytes).await?;

        let markdown = render_markdown(snapshot);
        Self::atomic_write(&self.markdown_path(), markdown.as_bytes()).await?;
        Ok(())
    }

    async fn resolve(&self, snapshot: &Snapshot, entity_ref: EntityRef) -> CortexResult<EntityId> {
        match entity_ref {
            EntityRef::Id(id) => {
                if snapshot.entities.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(CortexError::entity_not_found(id.to_string()))
                }
            }
            EntityRef::Name(name) => {
                let normalized = normalize(&name);
                snapshot
                    .entities
                    .values()
                    .find(|e| e.normalized_name() == normalized)
                    .map(|e| e.id.clone())
                    .ok_or_else(|| CortexError::entity_not_found(name))
            }
        }
    }
}

fn render_markdown(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    out.push_str("# Knowledge graph\n\n");
    let mut entities: Vec<&Entity> = snapshot.entities.values().collect();
    entities.sort_by(|a, b| a.name.cmp(&b.name));
    for entity in entities {
        out.push_str(&format!("## {} ({})\n\n", entity.name, entity.entity_type));
        for obs in snapshot
            .observations
            .values()
            .filter(|o| o.entity_id == entity.id)
        {
            out.push_str(&format!("- {}\n", obs.text));
        }
        out.push('\n');
    }
    out
}

/// A coarse random-looking suffix for temp file names, built from a
/// timestamp (this crate has no dependency on `uuid` or `rand`; a
/// nanosecond timestamp is unique enough for a same-process temp name).
fn uuid_like_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[async_trait]
impl EventLog for FileBackend {
    async fn append(&self, event: GraphEvent) -> CortexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut lines = self.read_lines().await?;

        if lines.is_empty() && !event.is_marker() {
            return Err(CortexError::MarkerMismatch(
                "first record appended to an empty log must be a marker".to_string(),
            ));
        }
        if !lines.is_empty() {
            match serde_json::from_str::<GraphEvent>(&lines[0]) {
                Ok(GraphEvent::Marker { .. }) => {}
                _ => {
                    return Err(CortexError::MarkerMismatch(
                        "log[0] is not a valid marker".to_string(),
                    ))
                }
            }
        }

        let serialized = serde_json::to_string(&event)?;
        lines.push(serialized);
        let contents = lines.join("\n") + "\n";
        Self::atomic_write(&self.log_path(), contents.as_bytes()).await?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn read_all(&self) -> CortexResult<Vec<GraphEvent>> {
        let lines = self.read_lines().await?;
        Ok(Self::parse_events(&lines))
    }

    async fn truncate_and_replace(&self, events: Vec<GraphEvent>) -> CortexResult<()> {
        let _guard = self.write_lock.lock().await;
        let contents = events
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n")
            + "\n";
        Self::atomic_write(&self.log_path(), contents.as_bytes()).await?;
        self.cache.write().await.invalidate();
        Ok(())
    }

    async fn generation(&self) -> CortexResult<Generation> {
        let lines = self.read_lines().await?;
        Ok(Generation(lines.len() as u64))
    }
}

#[async_trait]
impl GraphStore for FileBackend {
    async fn initialize(&self) -> CortexResult<()> {
        let lines = self.read_lines().await?;
        if lines.is_empty() {
            self.append_raw(GraphEvent::marker()).await?;
        } else {
            match serde_json::from_str::<GraphEvent>(&lines[0]) {
                Ok(GraphEvent::Marker { source, version })
                    if source == GraphEvent::MARKER_SOURCE && version == GraphEvent::MARKER_VERSION => {}
                _ => {
                    return Err(CortexError::MarkerMismatch(
                        "existing log has no valid marker at index 0".to_string(),
                    ))
                }
            }
        }
        self.rebuild().await.map(|_| ())
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
        let snapshot = self.current_snapshot().await?;
        let now = Utc::now();
        let existing = snapshot.entities.get(&id);
        let created_at = existing.map(|e| e.created_at).unwrap_or(now);

        // Shallow union: start from the existing attrs, then let the
        // caller's keys win. entity_type always replaces, per upsert
        // semantics.
        let mut merged_attrs = existing.map(|e| e.attrs.clone()).unwrap_or_default();
        merged_attrs.extend(attrs);

        self.append_raw(GraphEvent::EntityUpsert {
            id: id.clone(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            attrs: merged_attrs.clone(),
            ts: now,
        })
        .await?;

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
        let snapshot = self.current_snapshot().await?;
        let entity_id = self.resolve(&snapshot, entity_ref).await?;
        let ts = timestamp.unwrap_or_else(Utc::now);
        let id = ObservationId::derive(&entity_id, text, ts);

        self.append_raw(GraphEvent::ObservationAdd {
            id: id.clone(),
            entity_id: entity_id.clone(),
            text: text.to_string(),
            source: source.clone(),
            ts,
        })
        .await?;

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
        let snapshot = self.current_snapshot().await?;
        let from_id = self.resolve(&snapshot, from).await?;
        let to_id = self.resolve(&snapshot, to).await?;
        let id = cortexd_types::RelationId::derive(&from_id, &to_id, relation_type);

        if let Some(existing) = snapshot.relations.get(&id) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        self.append_raw(GraphEvent::RelationAdd {
            id: id.clone(),
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            relation_type: relation_type.to_string(),
            ts: now,
        })
        .await?;

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
        let snapshot = self.current_snapshot().await?;
        let (Ok(from_id), Ok(to_id)) = (
            self.resolve(&snapshot, from).await,
            self.resolve(&snapshot, to).await,
        ) else {
            return Ok(());
        };
        let id = cortexd_types::RelationId::derive(&from_id, &to_id, relation_type);
        if !snapshot.relations.contains_key(&id) {
            return Ok(());
        }
        self.append_raw(GraphEvent::RelationRemove { id, ts: Utc::now() }).await
    }

    async fn delete_entity(&self, entity_ref: EntityRef) -> CortexResult<()> {
        let snapshot = self.current_snapshot().await?;
        let id = self.resolve(&snapshot, entity_ref).await?;
        self.append_raw(GraphEvent::EntityDelete { id, ts: Utc::now() }).await
    }

    async fn delete_observation(&self, id: &ObservationId) -> CortexResult<()> {
        self.append_raw(GraphEvent::ObservationDelete {
            id: id.clone(),
            ts: Utc::now(),
        })
        .await
    }

    async fn search(&self, query: &str, opts: SearchOptions) -> CortexResult<SearchResults> {
        let snapshot = self.current_snapshot().await?;
        let entity_hits = search_entities(&snapshot, query, opts.limit);
        let scoped: HashSet<EntityId> = entity_hits.iter().map(|(e, _)| e.id.clone()).collect();
        Ok(SearchResults {
            entities: entity_hits.into_iter().map(|(e, _)| e).collect(),
            observations: search_observations(&snapshot, query, opts.limit),
            relations: search_relations(&snapshot, query, &scoped),
        })
    }

    async fn expand(
        &self,
        seeds: &[EntityId],
        depth: u8,
    ) -> CortexResult<(Vec<Entity>, Vec<Relation>)> {
        let snapshot = self.current_snapshot().await?;
        Ok(expand(&snapshot, seeds, depth))
    }

    async fn snapshot(&self) -> CortexResult<Snapshot> {
        self.current_snapshot().await
    }

    async fn rebuild(&self) -> CortexResult<Snapshot> {
        let lines = self.read_lines().await?;
        let generation = Generation(lines.len() as u64);
        self.rebuild_with_lines(lines, generation).await
    }

    async fn compact(&self) -> CortexResult<CompactionReport> {
        let before_bytes = tokio::fs::metadata(self.log_path())
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let snapshot = self.rebuild().await?;
        let minimal = minimal_events(&snapshot);
        self.truncate_and_replace(minimal).await?;

        let after_bytes = tokio::fs::metadata(self.log_path())
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        // The snapshot is unchanged by compaction; re-seed the cache so the
        // next read doesn't pay for an avoidable rebuild.
        let new_generation = self.generation().await?;
        self.cache.write().await.store(new_generation, snapshot);

        Ok(CompactionReport {
            before_bytes,
            after_bytes,
        })
    }
}

impl FileBackend {
    async fn append_raw(&self, event: GraphEvent) -> CortexResult<()> {
        EventLog::append(self, event).await
    }
}
