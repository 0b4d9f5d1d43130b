//! Turns one file into embedded, metadata-rich chunks.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    Metadata,
    chunking::{ChunkingConfig, chunk_id, chunk_text},
    embedding::Embedder,
    error::{Error, Result},
    extract,
    text_util::normalize_whitespace,
    vector_store::DEFAULT_BATCH_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Every chunk was embedded (and, once stored, written).
    Success,
    /// Some or all chunks were lost, or the document produced none.
    Partial,
    /// Extraction or chunking failed.
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedChunk {
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub chunks: Vec<ProcessedChunk>,
    pub metadata: Metadata,
    /// Wall-clock seconds spent processing.
    pub processing_time: f64,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Chunks produced before embedding.
    #[serde(default)]
    pub raw_chunk_count: usize,
    /// Store ids of the persisted chunks, in chunk order.
    #[serde(default)]
    pub document_ids: Vec<String>,
}

impl ProcessingResult {
    fn failed(
        path: &Path,
        mut metadata: Metadata,
        error: &Error,
        started: Instant,
    ) -> Self {
        metadata.insert("file_path".into(), json!(path.display().to_string()));
        Self {
            chunks: Vec::new(),
            metadata,
            processing_time: started.elapsed().as_secs_f64(),
            status: ProcessingStatus::Failed,
            error: Some(error.to_string()),
            raw_chunk_count: 0,
            document_ids: Vec::new(),
        }
    }
}

/// Derived metadata describing the file at `path`.
///
/// `file_id` is stable for a given absolute path: `file_` followed by the
/// first 16 hex digits of its blake3 hash.
pub fn file_metadata(path: &Path) -> Result<Metadata> {
    let absolute = absolute_path(path)?;
    let stat = std::fs::metadata(&absolute)?;

    let modified = stat
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let absolute_str = absolute.display().to_string();
    let hash = blake3::hash(absolute_str.as_bytes()).to_hex();
    let file_name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = absolute
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    let mut metadata = Metadata::new();
    metadata.insert("file_id".into(), json!(format!("file_{}", &hash[..16])));
    metadata.insert("file_name".into(), json!(file_name));
    metadata.insert("file_extension".into(), json!(extension));
    metadata.insert("file_size".into(), json!(stat.len()));
    metadata.insert("modified_unix".into(), json!(modified));
    metadata.insert("absolute_path".into(), json!(absolute_str));
    Ok(metadata)
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => Ok(std::path::absolute(path)?),
    }
}

/// `base` overlaid with `overlay`; keys in `overlay` win.
fn merged(base: &Metadata, overlay: &Metadata) -> Metadata {
    let mut out = base.clone();
    out.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

pub struct DocumentProcessor {
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl DocumentProcessor {
    pub fn new(embedder: Arc<dyn Embedder>, chunking: ChunkingConfig) -> Self {
        Self {
            embedder,
            chunking,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Embed chunks `batch_size` at a time.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    /// Extract, chunk and embed the file at `path`.
    ///
    /// Failures are reported through [`ProcessingResult::status`]; this
    /// never returns an error.
    pub fn process_document(
        &self,
        path: &Path,
        metadata: &Metadata,
    ) -> ProcessingResult {
        let started = Instant::now();

        let file_meta = match file_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot stat file");
                return ProcessingResult::failed(path, metadata.clone(), &e, started);
            }
        };
        let file_id = file_meta
            .get("file_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        tracing::info!(path = %path.display(), %file_id, "processing document");

        let raw = match extract::extract(path) {
            Ok(text) if text.is_empty() => {
                let e = Error::Extraction {
                    path: path.to_path_buf(),
                    message: "no text could be extracted".into(),
                };
                tracing::warn!("{e}");
                return ProcessingResult::failed(path, metadata.clone(), &e, started);
            }
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "extraction failed");
                return ProcessingResult::failed(path, metadata.clone(), &e, started);
            }
        };

        let chunks = chunk_text(
            &normalize_whitespace(&raw),
            self.chunking.chunk_size,
            self.chunking.overlap,
        );
        let result_metadata = merged(metadata, &file_meta);

        if chunks.is_empty() {
            tracing::warn!(path = %path.display(), "no chunks produced");
            return ProcessingResult {
                chunks: Vec::new(),
                metadata: result_metadata,
                processing_time: started.elapsed().as_secs_f64(),
                status: ProcessingStatus::Partial,
                error: None,
                raw_chunk_count: 0,
                document_ids: Vec::new(),
            };
        }

        let total = chunks.len();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut embeddings = Vec::with_capacity(total);
        for batch in texts.chunks(self.batch_size) {
            embeddings.extend(self.embedder.embed_many(batch));
        }

        let mut processed = Vec::with_capacity(total);
        for (position, (chunk, embedding)) in
            chunks.into_iter().zip(embeddings).enumerate()
        {
            let embedding = match embedding {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        position,
                        error = %e,
                        "failed to embed chunk"
                    );
                    continue;
                }
            };

            let mut chunk_meta = merged(&merged(&chunk.metadata(), &file_meta), metadata);
            chunk_meta.insert("chunk_id".into(), json!(chunk_id(&file_id, position)));
            chunk_meta.insert("position".into(), json!(position));
            chunk_meta.insert("total_chunks".into(), json!(total));

            processed.push(ProcessedChunk {
                text: chunk.text,
                metadata: chunk_meta,
                embedding,
            });
        }

        let status = if processed.len() == total {
            ProcessingStatus::Success
        } else {
            ProcessingStatus::Partial
        };
        let processing_time = started.elapsed().as_secs_f64();

        tracing::info!(
            path = %path.display(),
            embedded = processed.len(),
            total,
            seconds = processing_time,
            %status,
            "processed document"
        );

        ProcessingResult {
            chunks: processed,
            metadata: result_metadata,
            processing_time,
            status,
            error: None,
            raw_chunk_count: total,
            document_ids: Vec::new(),
        }
    }
}

impl std::fmt::Debug for DocumentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProcessor")
            .field("embedder", &self.embedder.name())
            .field("chunking", &self.chunking)
            .finish()
    }
}
