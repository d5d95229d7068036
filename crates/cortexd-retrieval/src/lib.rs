#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cortexd-retrieval** – builds a byte-budgeted "context pack" for a
//! query out of three collaborators: a small digest read from a handful
//! of core documents, a bounded neighborhood from the knowledge graph,
//! and excerpts pulled from whatever documents the graph points at.

mod document_store;
mod engine;
mod excerpt;
mod markdown;

pub use document_store::{validate_path, DocumentStore, FsDocumentStore, SqlDocumentStore, ensure_documents_schema};
pub use engine::{ContextPack, CoreDocumentSpec, DocumentExcerpt, RetrievalEngine, RetrievalOptions};
pub use excerpt::{section_by_heading, top_of_file, window_around_match, Excerpt, DEFAULT_WINDOW_LINES};
