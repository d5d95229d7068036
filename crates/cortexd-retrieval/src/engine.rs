//! Assembles a byte-budgeted "context pack" for a query: a digest pulled
//! from small core documents, a bounded graph neighborhood, and excerpts
//! from the documents the graph points at.

use crate::document_store::DocumentStore;
use crate::excerpt::{section_by_heading, top_of_file, window_around_match, DEFAULT_WINDOW_LINES};
use crate::markdown::{heading_level, heading_text};
use cortexd_graph_core::{GraphStore, SearchOptions};
use cortexd_types::{CortexResult, DocumentPointer, Entity, EntityId, Observation, Relation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

static DOC_POINTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^DOC:\s*(\S+)(?:\s*#\s*(.+))?$").unwrap());

/// Observations collected per graph hit are capped regardless of how many
/// the search actually found.
const MAX_OBSERVATIONS_PER_ENTITY: usize = 5;

/// Excerpting stops once the remaining budget drops below this, rather
/// than emitting a sliver that isn't useful.
const MIN_REMAINING_CHARS: usize = 50;

/// Tuning knobs for one [`RetrievalEngine::retrieve`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub max_chars: usize,
    pub max_files: usize,
    pub graph_limit: usize,
    pub graph_depth: u8,
    pub prefer_core_files: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        RetrievalOptions {
            max_chars: 8000,
            max_files: 4,
            graph_limit: 6,
            graph_depth: 1,
            prefer_core_files: true,
        }
    }
}

/// Names one small document and the headings in it whose trailing bullet
/// items feed the digest — "current tasks", "issues", "next steps", and
/// similar running lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreDocumentSpec {
    pub path: String,
    pub headings: Vec<String>,
    /// How many of the most recent bullets under each heading to keep.
    pub max_items_per_heading: usize,
}

/// One excerpt pulled from a document pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentExcerpt {
    pub path: String,
    pub heading: Option<String>,
    pub text: String,
    pub truncated: bool,
}

/// The assembled, budget-bounded context returned to a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPack {
    pub digest: String,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub observations: Vec<Observation>,
    pub excerpts: Vec<DocumentExcerpt>,
    pub truncated: bool,
    pub used_chars: usize,
}

/// Combines a graph store and a document store into one targeted-context
/// lookup. Holds `Arc<dyn _>` collaborators rather than generics so one
/// engine can be built once and shared across requests.
pub struct RetrievalEngine {
    graph: Arc<dyn GraphStore>,
    documents: Arc<dyn DocumentStore>,
    core_documents: Vec<CoreDocumentSpec>,
}

impl RetrievalEngine {
    /// Builds an engine over `graph`/`documents`, with `core_documents`
    /// naming the small files the digest step reads.
    pub fn new(
        graph: Arc<dyn GraphStore>,
        documents: Arc<dyn DocumentStore>,
        core_documents: Vec<CoreDocumentSpec>,
    ) -> Self {
        RetrievalEngine {
            graph,
            documents,
            core_documents,
        }
    }

    /// Runs the full digest → graph query → pointer ranking → excerpting
    /// pipeline, never returning more than `opts.max_chars` of total
    /// content.
    pub async fn retrieve(&self, query: &str, opts: RetrievalOptions) -> CortexResult<ContextPack> {
        let digest_budget = opts.max_chars * 20 / 100;
        let digest = self.build_digest(digest_budget).await;
        let mut used_chars = digest.chars().count();

        let search_opts = SearchOptions {
            limit: opts.graph_limit,
            depth: opts.graph_depth,
        };
        let results = self.graph.search(query, search_opts).await?;
        let seed_ids: Vec<EntityId> = results.entities.iter().map(|e| e.id.clone()).collect();
        let (entities, relations) = if seed_ids.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            self.graph.expand(&seed_ids, opts.graph_depth).await?
        };

        let mut observations = Vec::new();
        for entity in &results.entities {
            observations.extend(
                results
                    .observations
                    .iter()
                    .filter(|obs| obs.entity_id == entity.id)
                    .take(MAX_OBSERVATIONS_PER_ENTITY)
                    .cloned(),
            );
        }
        used_chars += observations.iter().map(|o| o.text.chars().count()).sum::<usize>();
        used_chars += entities.iter().map(|e| e.name.chars().count()).sum::<usize>();

        let mut pointers = self.extract_pointers(&results.entities, &observations);
        pointers.sort_by(|a, b| compare_pointers(a, b, opts.prefer_core_files));

        let remaining = opts.max_chars.saturating_sub(used_chars);
        let (excerpts, mut truncated) = self
            .excerpt_pointers(&pointers, query, opts.max_files, remaining)
            .await;
        used_chars += excerpts.iter().map(|e| e.text.chars().count()).sum::<usize>();
        if used_chars > opts.max_chars {
            truncated = true;
        }

        Ok(ContextPack {
            digest,
            entities,
            relations,
            observations,
            excerpts,
            truncated,
            used_chars,
        })
    }

    async fn build_digest(&self, budget_chars: usize) -> String {
        let mut digest = String::new();
        'docs: for spec in &self.core_documents {
            let content = match self.documents.read(&spec.path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::debug!(path = %spec.path, error = %err, "skipping unreadable core document");
                    continue;
                }
            };
            for heading in &spec.headings {
                let bullets = extract_bullets_under_heading(&content, heading, spec.max_items_per_heading);
                if bullets.is_empty() {
                    continue;
                }
                digest.push_str("## ");
                digest.push_str(heading);
                digest.push('\n');
                for bullet in bullets {
                    digest.push_str("- ");
                    digest.push_str(&bullet);
                    digest.push('\n');
                }
                if digest.chars().count() >= budget_chars {
                    break 'docs;
                }
            }
        }
        if digest.chars().count() > budget_chars {
            digest = digest.chars().take(budget_chars).collect();
        }
        digest
    }

    fn extract_pointers(&self, entities: &[Entity], observations: &[Observation]) -> Vec<DocumentPointer> {
        let mut pointers = Vec::new();
        let count = entities.len().max(1) as f32;
        for (idx, entity) in entities.iter().enumerate() {
            // `entities` is already ranked by score descending (the search
            // contract), so position is a faithful stand-in for the score
            // itself, which GraphStore::search doesn't expose.
            let pseudo_score = 1.0 - (idx as f32 / count);

            if let Some(doc_path) = entity.attrs.get("docPath").and_then(|v| v.as_str()) {
                let heading = entity
                    .attrs
                    .get("heading")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                pointers.push(DocumentPointer {
                    path: doc_path.to_string(),
                    heading,
                    entity_score: pseudo_score,
                    is_core_file: self.is_core_file(doc_path),
                });
            }

            for obs in observations.iter().filter(|o| o.entity_id == entity.id) {
                if let Some(caps) = DOC_POINTER_RE.captures(obs.text.trim()) {
                    let path = caps.get(1).unwrap().as_str().to_string();
                    let heading = caps.get(2).map(|m| m.as_str().trim().to_string());
                    pointers.push(DocumentPointer {
                        is_core_file: self.is_core_file(&path),
                        path,
                        heading,
                        entity_score: pseudo_score,
                    });
                }
            }
        }
        pointers
    }

    fn is_core_file(&self, path: &str) -> bool {
        self.core_documents.iter().any(|spec| spec.path == path)
    }

    async fn excerpt_pointers(
        &self,
        pointers: &[DocumentPointer],
        query: &str,
        max_files: usize,
        mut remaining: usize,
    ) -> (Vec<DocumentExcerpt>, bool) {
        let mut excerpts = Vec::new();
        let mut truncated = false;
        for pointer in pointers {
            if excerpts.len() >= max_files {
                break;
            }
            if remaining < MIN_REMAINING_CHARS {
                truncated = true;
                break;
            }
            let content = match self.documents.read(&pointer.path).await {
                Ok(content) => content,
                Err(_) => continue,
            };

            let excerpt = pointer
                .heading
                .as_deref()
                .and_then(|heading| section_by_heading(&content, heading, remaining))
                .or_else(|| window_around_match(&content, query, DEFAULT_WINDOW_LINES, remaining))
                .unwrap_or_else(|| top_of_file(&content, remaining));

            truncated = truncated || excerpt.truncated;
            remaining = remaining.saturating_sub(excerpt.text.chars().count());
            excerpts.push(DocumentExcerpt {
                path: pointer.path.clone(),
                heading: pointer.heading.clone(),
                text: excerpt.text,
                truncated: excerpt.truncated,
            });
        }
        (excerpts, truncated)
    }
}

/// Higher entity score first; a heading hint beats none; core files beat
/// others when requested; lexical path ascending breaks remaining ties.
fn compare_pointers(a: &DocumentPointer, b: &DocumentPointer, prefer_core_files: bool) -> Ordering {
    b.entity_score
        .partial_cmp(&a.entity_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.heading.is_some().cmp(&a.heading.is_some()))
        .then_with(|| {
            if prefer_core_files {
                b.is_core_file.cmp(&a.is_core_file)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.path.cmp(&b.path))
}

fn extract_bullets_under_heading(content: &str, heading: &str, max_items: usize) -> Vec<String> {
    let needle = heading.to_lowercase();
    let mut in_section = false;
    let mut section_level = 0;
    let mut bullets = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(level) = heading_level(trimmed) {
            if in_section {
                if level <= section_level {
                    break;
                }
                continue;
            }
            if heading_text(trimmed).to_lowercase() == needle {
                in_section = true;
                section_level = level;
            }
            continue;
        }
        if in_section && (trimmed.starts_with('-') || trimmed.starts_with('*')) {
            bullets.push(trimmed.trim_start_matches(['-', '*']).trim().to_string());
        }
    }
    let start = bullets.len().saturating_sub(max_items);
    bullets[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::FsDocumentStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use cortexd_graph_core::{CompactionReport, EntityRef, SearchResults};
    use cortexd_types::{ObservationId, ObservationSource, Snapshot};
    use std::collections::HashMap;

    struct FakeGraphStore {
        results: SearchResults,
        expanded: (Vec<Entity>, Vec<Relation>),
    }

    #[async_trait]
    impl GraphStore for FakeGraphStore {
        async fn initialize(&self) -> CortexResult<()> {
            Ok(())
        }
        async fn upsert_entity(
            &self,
            _name: &str,
            _entity_type: &str,
            _attrs: HashMap<String, serde_json::Value>,
        ) -> CortexResult<Entity> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn add_observation(
            &self,
            _entity_ref: EntityRef,
            _text: &str,
            _source: ObservationSource,
            _timestamp: Option<chrono::DateTime<Utc>>,
        ) -> CortexResult<Observation> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn link_entities(
            &self,
            _from: EntityRef,
            _relation_type: &str,
            _to: EntityRef,
        ) -> CortexResult<Relation> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn unlink_entities(
            &self,
            _from: EntityRef,
            _relation_type: &str,
            _to: EntityRef,
        ) -> CortexResult<()> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn delete_entity(&self, _entity_ref: EntityRef) -> CortexResult<()> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn delete_observation(&self, _id: &ObservationId) -> CortexResult<()> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn search(&self, _query: &str, _opts: SearchOptions) -> CortexResult<SearchResults> {
            Ok(self.results.clone())
        }
        async fn expand(
            &self,
            _seeds: &[EntityId],
            _depth: u8,
        ) -> CortexResult<(Vec<Entity>, Vec<Relation>)> {
            Ok(self.expanded.clone())
        }
        async fn snapshot(&self) -> CortexResult<Snapshot> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn rebuild(&self) -> CortexResult<Snapshot> {
            unimplemented!("not exercised by retrieval tests")
        }
        async fn compact(&self) -> CortexResult<CompactionReport> {
            unimplemented!("not exercised by retrieval tests")
        }
    }

    fn entity_with_doc_path(name: &str, doc_path: &str) -> Entity {
        let mut attrs = HashMap::new();
        attrs.insert("docPath".to_string(), serde_json::Value::String(doc_path.to_string()));
        Entity {
            id: EntityId::derive(name, "doc"),
            name: name.to_string(),
            entity_type: "doc".to_string(),
            attrs,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn retrieve_assembles_digest_and_excerpt_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("progress.md"),
            "# Progress\n\n## Current tasks\n- old task\n- write retrieval engine\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.md"), "# Notes\nThe widget uses blake3 hashing.\n").unwrap();

        let entity = entity_with_doc_path("Widget", "notes.md");
        let results = SearchResults {
            entities: vec![entity.clone()],
            observations: Vec::new(),
            relations: Vec::new(),
        };

        let graph = Arc::new(FakeGraphStore {
            results,
            expanded: (vec![entity], Vec::new()),
        });
        let documents = Arc::new(FsDocumentStore::new(dir.path()));
        let core_documents = vec![CoreDocumentSpec {
            path: "progress.md".to_string(),
            headings: vec!["Current tasks".to_string()],
            max_items_per_heading: 1,
        }];

        let engine = RetrievalEngine::new(graph, documents, core_documents);
        let pack = engine.retrieve("blake3", RetrievalOptions::default()).await.unwrap();

        assert!(pack.digest.contains("write retrieval engine"));
        assert!(!pack.digest.contains("old task"));
        assert_eq!(pack.excerpts.len(), 1);
        assert!(pack.excerpts[0].text.contains("blake3"));
        assert!(pack.used_chars <= RetrievalOptions::default().max_chars);
    }

    #[tokio::test]
    async fn invalid_pointer_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let entity = entity_with_doc_path("Ghost", "../escape.md");
        let results = SearchResults {
            entities: vec![entity.clone()],
            observations: Vec::new(),
            relations: Vec::new(),
        };
        let graph = Arc::new(FakeGraphStore {
            results,
            expanded: (vec![entity], Vec::new()),
        });
        let documents = Arc::new(FsDocumentStore::new(dir.path()));
        let engine = RetrievalEngine::new(graph, documents, Vec::new());

        let pack = engine.retrieve("anything", RetrievalOptions::default()).await.unwrap();
        assert!(pack.excerpts.is_empty());
    }

    #[test]
    fn compare_pointers_prefers_heading_hint_then_core_file_then_path() {
        let a = DocumentPointer {
            path: "b.md".to_string(),
            heading: None,
            entity_score: 1.0,
            is_core_file: false,
        };
        let b = DocumentPointer {
            path: "a.md".to_string(),
            heading: Some("Intro".to_string()),
            entity_score: 1.0,
            is_core_file: false,
        };
        assert_eq!(compare_pointers(&a, &b, true), Ordering::Greater);
    }

    #[test]
    fn extract_bullets_keeps_only_most_recent() {
        let doc = "## Tasks\n- one\n- two\n- three\n";
        let bullets = extract_bullets_under_heading(doc, "Tasks", 2);
        assert_eq!(bullets, vec!["two".to_string(), "three".to_string()]);
    }
}
