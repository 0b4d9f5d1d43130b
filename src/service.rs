//! The public face of the pipeline: processing, storage and retrieval behind
//! one handle.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    Metadata,
    cache::ProcessingCache,
    config::PipelineConfig,
    control::CancelToken,
    embedding::Embedder,
    error::{Error, Result},
    extract::Capabilities,
    processor::{DocumentProcessor, ProcessingResult, ProcessingStatus},
    retriever::{RerankerFactory, RetrievalResult, Retriever},
    text_util::assemble_context,
    vector_store::{NewRecord, VectorRecord, VectorStore},
    walker,
};

/// Where the service keeps its state, and how it behaves.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub vectors_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub pipeline: PipelineConfig,
}

/// Outcome of one file processed by [`RagService::ingest_dir`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub relative_path: PathBuf,
    pub status: ProcessingStatus,
    pub chunks: usize,
    pub stored: usize,
    pub error: Option<String>,
}

pub struct RagService {
    config: PipelineConfig,
    store: Arc<VectorStore>,
    retriever: Retriever,
    processor: DocumentProcessor,
    cache: ProcessingCache,
}

impl RagService {
    /// Open (or create) the collection and cache described by `config`.
    ///
    /// `reranker_factory` is only called when reranking is enabled; see
    /// [`Retriever::new`] for how a failure is handled.
    pub fn open(
        config: ServiceConfig,
        embedder: Arc<dyn Embedder>,
        reranker_factory: Option<RerankerFactory>,
    ) -> Result<Self> {
        let ServiceConfig {
            vectors_dir,
            cache_dir,
            pipeline,
        } = config;
        pipeline.validate()?;

        std::fs::create_dir_all(&vectors_dir)?;
        let store = Arc::new(VectorStore::open(
            &vectors_dir,
            &pipeline.collection,
            Arc::clone(&embedder),
        )?);
        let retriever = Retriever::new(
            Arc::clone(&store),
            pipeline.retriever(),
            reranker_factory,
        );
        let processor = DocumentProcessor::new(embedder, pipeline.chunking())
            .with_batch_size(pipeline.batch_size);
        let cache = ProcessingCache::new(&cache_dir)?;

        tracing::debug!(
            collection = %pipeline.collection,
            reranking = retriever.reranking_active(),
            "service ready"
        );

        Ok(Self {
            config: pipeline,
            store,
            retriever,
            processor,
            cache,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::detect()
    }

    // -- Ingestion --

    /// Process `path` and store its chunks, reusing a cached result when
    /// one exists and `force_reprocess` is not set.
    ///
    /// Fresh chunks replace any the file stored before. A result whose
    /// chunks were not all written is downgraded to `partial`, so it is not
    /// cached and the next call retries.
    ///
    /// Only a missing file is an error; every other failure is reported
    /// through the result's status.
    pub fn process_document(
        &self,
        path: &Path,
        metadata: &Metadata,
        force_reprocess: bool,
    ) -> Result<ProcessingResult> {
        self.process_cancellable(path, metadata, force_reprocess, &CancelToken::new())
    }

    fn process_cancellable(
        &self,
        path: &Path,
        metadata: &Metadata,
        force_reprocess: bool,
        cancel: &CancelToken,
    ) -> Result<ProcessingResult> {
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "file",
                name: path.display().to_string(),
            });
        }

        let run = || self.process_and_store(path, metadata, cancel);
        if self.config.use_cache {
            self.cache.get_or_process(path, metadata, force_reprocess, run)
        } else {
            Ok(run())
        }
    }

    fn process_and_store(
        &self,
        path: &Path,
        metadata: &Metadata,
        cancel: &CancelToken,
    ) -> ProcessingResult {
        let mut result = self.processor.process_document(path, metadata);
        if result.chunks.is_empty() {
            return result;
        }

        // Reprocessing replaces whatever an earlier run stored for the file.
        if let Some(file_id) = result.metadata.get("file_id").and_then(Value::as_str) {
            self.remove_file_chunks(path, file_id);
        }

        let records = result
            .chunks
            .iter()
            .map(|chunk| NewRecord {
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                vector: Some(chunk.embedding.clone()),
            })
            .collect();
        result.document_ids = self.store.add(records, self.config.batch_size, cancel);

        let stored = result.document_ids.len();
        let embedded = result.chunks.len();
        if stored < embedded {
            tracing::warn!(
                path = %path.display(),
                stored,
                chunks = embedded,
                "not every chunk was stored"
            );
            if result.status == ProcessingStatus::Success {
                result.status = ProcessingStatus::Partial;
                result.error = Some(format!("stored {stored} of {embedded} chunks"));
            }
        }
        result
    }

    fn remove_file_chunks(&self, path: &Path, file_id: &str) {
        let prefix = format!("{file_id}_chunk_");
        let removed = self.store.try_delete_where(|meta| {
            meta.get("chunk_id")
                .and_then(Value::as_str)
                .is_some_and(|id| id.starts_with(&prefix))
        });
        match removed {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(path = %path.display(), removed, "replaced stored chunks");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove stored chunks");
            }
        }
    }

    /// Process every supported file under `root`.
    ///
    /// `glob` restricts the files by their path relative to `root`. `cancel`
    /// is checked between files; on cancellation the summaries gathered so
    /// far are returned. `progress` is called after each file with the
    /// number of files done and the total.
    pub fn ingest_dir(
        &self,
        root: &Path,
        glob: Option<&str>,
        metadata: &Metadata,
        force_reprocess: bool,
        cancel: &CancelToken,
        mut progress: impl FnMut(usize, usize, &IngestSummary),
    ) -> Result<Vec<IngestSummary>> {
        let matcher = glob.map(walker::compile_glob).transpose()?;
        let files = walker::discover_files(root, matcher.as_ref())?;
        let total = files.len();
        tracing::info!(root = %root.display(), total, "ingesting directory");

        let mut summaries = Vec::with_capacity(total);
        for file in files {
            if cancel.is_cancelled() {
                tracing::info!(done = summaries.len(), total, "ingest cancelled");
                break;
            }

            let mut file_meta = metadata.clone();
            file_meta.insert(
                "relative_path".into(),
                Value::String(file.relative_path.to_string_lossy().into_owned()),
            );

            let summary = match self.process_cancellable(
                &file.absolute_path,
                &file_meta,
                force_reprocess,
                cancel,
            ) {
                Ok(result) => IngestSummary {
                    relative_path: file.relative_path,
                    status: result.status,
                    chunks: result.chunks.len(),
                    stored: result.document_ids.len(),
                    error: result.error,
                },
                Err(e) => IngestSummary {
                    relative_path: file.relative_path,
                    status: ProcessingStatus::Failed,
                    chunks: 0,
                    stored: 0,
                    error: Some(e.to_string()),
                },
            };

            progress(summaries.len() + 1, total, &summary);
            summaries.push(summary);
        }

        Ok(summaries)
    }

    // -- Retrieval --

    /// Up to `n_results` passages for `query`; defaults to `rerank_top_k`.
    pub fn search(
        &self,
        query: &str,
        n_results: Option<usize>,
        filter: Option<&Metadata>,
    ) -> Vec<RetrievalResult> {
        self.search_with(query, n_results, filter, true)
    }

    /// Like [`search`](Self::search), skipping the reranker unless `rerank`.
    pub fn search_with(
        &self,
        query: &str,
        n_results: Option<usize>,
        filter: Option<&Metadata>,
        rerank: bool,
    ) -> Vec<RetrievalResult> {
        let n = n_results.unwrap_or(self.config.rerank_top_k);
        self.retriever.retrieve_with(query, n, filter, rerank)
    }

    pub fn batch_search(
        &self,
        queries: &[String],
        n_results: Option<usize>,
        filter: Option<&Metadata>,
    ) -> Vec<(String, Vec<RetrievalResult>)> {
        let n = n_results.unwrap_or(self.config.rerank_top_k);
        self.retriever.batch_retrieve(queries, n, filter)
    }

    pub fn similar(&self, id: &str, n: usize) -> Vec<RetrievalResult> {
        self.retriever.get_similar_documents(id, n)
    }

    /// Search and join the hits into one context block of at most
    /// `max_chars` characters, each passage labelled with its file name.
    pub fn context(
        &self,
        query: &str,
        n_results: Option<usize>,
        max_chars: usize,
    ) -> String {
        let results = self.search(query, n_results, None);
        assemble_context(
            results.iter().map(|r| {
                let source = r
                    .metadata
                    .get("file_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                (source, r.text.as_str())
            }),
            max_chars,
        )
    }

    // -- Maintenance --

    pub fn get_document(&self, id: &str) -> Option<VectorRecord> {
        self.store.get(id)
    }

    pub fn delete_document(&self, id: &str) -> bool {
        self.store.delete(&[id.to_string()])
    }

    pub fn count_documents(&self) -> usize {
        self.store.count()
    }

    /// Drop every stored chunk. Cached results are left in place; call
    /// [`clear_cache`](Self::clear_cache) to force reprocessing.
    pub fn reset_vector_store(&self) -> bool {
        self.store.clear()
    }

    pub fn clear_cache(&self) -> bool {
        self.cache.clear()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for RagService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagService")
            .field("collection", &self.config.collection)
            .field("retriever", &self.retriever)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        config::EmbedderKind,
        embedding::{HashingEmbedder, tests::FlakyEmbedder},
        reranker::{CrossEncoder, LexicalCrossEncoder},
    };

    fn config(root: &Path) -> ServiceConfig {
        ServiceConfig {
            vectors_dir: root.join("vectors"),
            cache_dir: root.join("cache"),
            pipeline: PipelineConfig {
                embedder: EmbedderKind::Hashing,
                chunk_size: 20,
                chunk_overlap: 5,
                ..PipelineConfig::default()
            },
        }
    }

    fn service(root: &Path) -> RagService {
        let factory: RerankerFactory =
            Box::new(|| Ok(Arc::new(LexicalCrossEncoder) as Arc<dyn CrossEncoder>));
        RagService::open(
            config(root),
            Arc::new(HashingEmbedder::new(128)),
            Some(factory),
        )
        .unwrap()
    }

    fn write_corpus(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("fox.txt"),
            "The quick brown fox jumps over the lazy dog.",
        )
        .unwrap();
        std::fs::write(
            dir.join("rust.md"),
            "Rust is a systems programming language focused on safety.",
        )
        .unwrap();
        std::fs::write(
            dir.join("fruit.txt"),
            "Bananas are an excellent source of potassium.",
        )
        .unwrap();
    }

    #[test]
    fn process_is_idempotent_through_cache() {
        let tmp = tempfile::tempdir().unwrap();
        write_corpus(&tmp.path().join("docs"));
        let path = tmp.path().join("docs/fox.txt");
        let service = service(tmp.path());
        let meta = json!({"source": "test"}).as_object().unwrap().clone();

        let first = service.process_document(&path, &meta, false).unwrap();
        assert_eq!(first.status, ProcessingStatus::Success);
        assert_eq!(first.document_ids.len(), 1);
        assert_eq!(service.count_documents(), 1);
        assert_eq!(service.cache_len(), 1);

        let second = service.process_document(&path, &meta, false).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        // Served from cache: nothing new was stored.
        assert_eq!(service.count_documents(), 1);

        // Forcing reprocesses and replaces the stored chunks.
        let forced = service.process_document(&path, &meta, true).unwrap();
        assert_eq!(service.count_documents(), 1);
        assert_ne!(forced.document_ids, first.document_ids);
        assert!(service.get_document(&first.document_ids[0]).is_none());
    }

    fn flaky_service(root: &Path) -> RagService {
        let mut config = config(root);
        config.pipeline.chunk_size = 3;
        config.pipeline.chunk_overlap = 0;
        config.pipeline.use_reranking = false;
        RagService::open(
            config,
            Arc::new(FlakyEmbedder(HashingEmbedder::new(32))),
            None,
        )
        .unwrap()
    }

    #[test]
    fn partial_reprocessing_replaces_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.md");
        std::fs::write(&path, "Good text here! This one will FAIL badly! More good text.")
            .unwrap();
        let service = flaky_service(tmp.path());

        let first = service.process_document(&path, &Metadata::new(), false).unwrap();
        assert_eq!(first.status, ProcessingStatus::Partial);
        assert_eq!(first.document_ids.len(), 2);
        assert_eq!(service.cache_len(), 0);

        let second = service.process_document(&path, &Metadata::new(), false).unwrap();
        assert_eq!(second.document_ids.len(), 2);
        assert_eq!(service.count_documents(), 2);
    }

    #[test]
    fn short_store_is_partial_and_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.md");
        std::fs::write(&path, "Alpha beta gamma. Delta epsilon zeta. Eta theta iota.")
            .unwrap();
        let service = flaky_service(tmp.path());

        let cancel = CancelToken::new();
        cancel.cancel();
        let cut = service
            .process_cancellable(&path, &Metadata::new(), false, &cancel)
            .unwrap();
        assert_eq!(cut.status, ProcessingStatus::Partial);
        assert_eq!(cut.chunks.len(), 3);
        assert!(cut.document_ids.is_empty());
        assert!(cut.error.is_some());
        assert_eq!(service.cache_len(), 0);

        let full = service.process_document(&path, &Metadata::new(), false).unwrap();
        assert_eq!(full.status, ProcessingStatus::Success);
        assert_eq!(full.document_ids.len(), 3);
        assert_eq!(service.count_documents(), 3);
        assert_eq!(service.cache_len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());
        let err = service
            .process_document(&tmp.path().join("missing.txt"), &Metadata::new(), false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "file", .. }));
    }

    #[test]
    fn unsupported_file_is_failed_and_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let service = service(tmp.path());

        let result = service.process_document(&path, &Metadata::new(), false).unwrap();
        assert_eq!(result.status, ProcessingStatus::Failed);
        assert!(result.error.is_some());
        assert_eq!(service.cache_len(), 0);
        assert_eq!(service.count_documents(), 0);
    }

    #[test]
    fn ingest_then_search() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs");
        write_corpus(&docs);
        let service = service(tmp.path());
        assert!(service.retriever().reranking_active());

        let mut seen = Vec::new();
        let summaries = service
            .ingest_dir(&docs, None, &Metadata::new(), false, &CancelToken::new(), |done, total, _| {
                seen.push((done, total))
            })
            .unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.status == ProcessingStatus::Success));
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(service.count_documents(), 3);

        let results = service.search("fox jumping", None, None);
        assert_eq!(results.len(), 3);
        assert!(results[0].text.contains("fox"));
        assert_eq!(results[0].metadata["relative_path"], json!("fox.txt"));
        for pair in results.windows(2) {
            assert!(pair[0].combined_score >= pair[1].combined_score);
        }

        let plain = service.search_with("fox", Some(1), None, false);
        assert_eq!(plain.len(), 1);
        assert!(plain[0].rerank_score.is_none());

        let context = service.context("bananas", Some(1), 4000);
        assert!(context.starts_with("--- fruit.txt ---"));
        assert!(context.contains("potassium"));
    }

    #[test]
    fn ingest_honours_glob_and_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs");
        write_corpus(&docs);
        let service = service(tmp.path());

        let only_txt = service
            .ingest_dir(&docs, Some("*.txt"), &Metadata::new(), false, &CancelToken::new(), |_, _, _| {})
            .unwrap();
        assert_eq!(only_txt.len(), 2);

        let cancel = CancelToken::new();
        cancel.cancel();
        let none = service
            .ingest_dir(&docs, None, &Metadata::new(), false, &cancel, |_, _, _| {})
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn similar_get_delete_reset() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs");
        write_corpus(&docs);
        let service = service(tmp.path());
        service
            .ingest_dir(&docs, None, &Metadata::new(), false, &CancelToken::new(), |_, _, _| {})
            .unwrap();

        let top = service.search("fox", Some(1), None).remove(0);
        let record = service.get_document(&top.id).unwrap();
        assert_eq!(record.text, top.text);

        let similar = service.similar(&top.id, 5);
        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|r| r.id != top.id));

        assert!(service.delete_document(&top.id));
        assert!(service.get_document(&top.id).is_none());
        assert_eq!(service.count_documents(), 2);

        assert!(service.reset_vector_store());
        assert_eq!(service.count_documents(), 0);
        assert!(service.search("fox", None, None).is_empty());

        assert!(service.cache_len() > 0);
        assert!(service.clear_cache());
        assert_eq!(service.cache_len(), 0);
    }

    #[test]
    fn invalid_pipeline_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.pipeline.chunk_overlap = config.pipeline.chunk_size;
        let result = RagService::open(config, Arc::new(HashingEmbedder::new(8)), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
