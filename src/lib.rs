//! docrag - a retrieval pipeline for your documents.
//!
//! Documents (plain text, Markdown, PDF, EPUB) are extracted to text, split
//! into overlapping sentence-aligned chunks, embedded and stored in a
//! persistent [redb](https://github.com/cberner/redb) vector store. Queries
//! run a coarse cosine search followed by optional cross-encoder reranking
//! (ColBERT MaxSim by default) with weighted score fusion.
//!
//! # Quick start
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use docrag::{
//!     DataDir,
//!     Metadata,
//!     RagService,
//!     ServiceConfig,
//!     config::{EmbedderKind, PipelineConfig},
//!     embedding::HashingEmbedder,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let pipeline = PipelineConfig {
//!     embedder: EmbedderKind::Hashing,
//!     ..PipelineConfig::default()
//! };
//! let service = RagService::open(
//!     ServiceConfig {
//!         vectors_dir: data_dir.vectors_dir().unwrap(),
//!         cache_dir: data_dir.cache_dir().unwrap(),
//!         pipeline,
//!     },
//!     Arc::new(HashingEmbedder::new(384)),
//!     None,
//! )
//! .unwrap();
//!
//! service
//!     .process_document(Path::new("notes.md"), &Metadata::new(), false)
//!     .unwrap();
//! for r in service.search("rust ownership", Some(5), None) {
//!     println!("{:.3} {}", r.combined_score, r.text);
//! }
//! ```

pub mod cache;
pub mod chunking;
pub mod config;
pub mod config_db;
pub mod control;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod model_manager;
pub mod processor;
pub mod reranker;
pub mod retriever;
pub mod service;
pub mod text_util;
pub mod vector_store;
pub mod walker;

/// Free-form JSON metadata attached to documents and chunks. Keys are kept
/// sorted.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub use cache::ProcessingCache;
pub use config_db::ConfigDb;
pub use control::CancelToken;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use processor::{DocumentProcessor, ProcessingResult, ProcessingStatus};
pub use retriever::{RetrievalResult, Retriever};
pub use service::{RagService, ServiceConfig};
pub use vector_store::VectorStore;
