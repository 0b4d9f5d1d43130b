//! Two-stage retrieval: coarse vector search, then optional cross-encoder
//! reranking with score fusion.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    Metadata,
    error::Result,
    reranker::CrossEncoder,
    vector_store::{Query, SearchHit, SearchOutcome, VectorStore},
};

/// Builds the cross-encoder lazily when the retriever is created.
pub type RerankerFactory =
    Box<dyn FnOnce() -> Result<Arc<dyn CrossEncoder>> + Send>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Candidates fetched from the store before reranking.
    pub retrieval_top_k: usize,
    pub use_reranking: bool,
    pub vector_weight: f32,
    pub rerank_weight: f32,
    /// Attach stored vectors to results.
    pub include_embeddings: bool,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            retrieval_top_k: 50,
            use_reranking: true,
            vector_weight: 0.4,
            rerank_weight: 0.6,
            include_embeddings: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Vector similarity in `[0, 1]`.
    pub vector_score: f32,
    /// Normalised cross-encoder score, when reranked.
    pub rerank_score: Option<f32>,
    pub combined_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl RetrievalResult {
    fn from_hit(hit: SearchHit, include_embedding: bool) -> Self {
        Self {
            id: hit.id,
            text: hit.text,
            metadata: hit.metadata,
            vector_score: hit.similarity,
            rerank_score: None,
            combined_score: hit.similarity,
            embedding: include_embedding.then_some(hit.vector),
        }
    }
}

/// Rewrites a query before it reaches the store.
pub trait QueryExpander: Send + Sync {
    fn expand(&self, query: &str) -> String;
}

/// Leaves queries untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl QueryExpander for PassThrough {
    fn expand(&self, query: &str) -> String {
        query.to_string()
    }
}

pub struct Retriever {
    store: Arc<VectorStore>,
    config: RetrieverConfig,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    expander: Box<dyn QueryExpander>,
}

impl Retriever {
    /// Create a retriever over `store`.
    ///
    /// The factory is only invoked when reranking is enabled. If it fails,
    /// reranking stays disabled for the lifetime of this retriever.
    pub fn new(
        store: Arc<VectorStore>,
        config: RetrieverConfig,
        reranker_factory: Option<RerankerFactory>,
    ) -> Self {
        let cross_encoder = match (config.use_reranking, reranker_factory) {
            (false, _) => None,
            (true, None) => {
                tracing::debug!("no cross-encoder configured, reranking off");
                None
            }
            (true, Some(factory)) => match factory() {
                Ok(encoder) => {
                    tracing::debug!(cross_encoder = encoder.name(), "reranking on");
                    Some(encoder)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "failed to initialise cross-encoder, reranking disabled"
                    );
                    None
                }
            },
        };

        Self {
            store,
            config,
            cross_encoder,
            expander: Box::new(PassThrough),
        }
    }

    pub fn with_expander(mut self, expander: impl QueryExpander + 'static) -> Self {
        self.expander = Box::new(expander);
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn reranking_active(&self) -> bool {
        self.cross_encoder.is_some()
    }

    /// Retrieve up to `n_results` passages for `query`, reranked when a
    /// cross-encoder is active.
    pub fn retrieve(
        &self,
        query: &str,
        n_results: usize,
        filter: Option<&Metadata>,
    ) -> Vec<RetrievalResult> {
        self.retrieve_with(query, n_results, filter, true)
    }

    /// Like [`retrieve`](Self::retrieve), with reranking skipped when
    /// `rerank` is `false`.
    pub fn retrieve_with(
        &self,
        query: &str,
        n_results: usize,
        filter: Option<&Metadata>,
        rerank: bool,
    ) -> Vec<RetrievalResult> {
        if n_results == 0 {
            return Vec::new();
        }

        let expanded = self.expander.expand(query);
        let fetch = self.config.retrieval_top_k.max(n_results);

        let hits = match self.store.search(Query::Text(&expanded), fetch, filter) {
            SearchOutcome::Found(hits) => hits,
            SearchOutcome::NoMatch => return Vec::new(),
            SearchOutcome::Failed { cause } => {
                tracing::warn!(query, cause, "coarse search failed");
                return Vec::new();
            }
        };

        let mut results: Vec<RetrievalResult> = hits
            .into_iter()
            .map(|hit| RetrievalResult::from_hit(hit, self.config.include_embeddings))
            .collect();

        if rerank && let Some(encoder) = &self.cross_encoder {
            self.rerank(encoder.as_ref(), &expanded, &mut results);
        }

        results.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
        results.truncate(n_results);
        results
    }

    /// Fuse cross-encoder scores into `results`. On failure the results keep
    /// their vector scores.
    fn rerank(
        &self,
        encoder: &dyn CrossEncoder,
        query: &str,
        results: &mut [RetrievalResult],
    ) {
        let texts: Vec<String> = results.iter().map(|r| r.text.clone()).collect();
        let scores = match encoder.score_batch(query, &texts) {
            Ok(scores) if scores.len() == results.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    expected = results.len(),
                    actual = scores.len(),
                    "cross-encoder returned wrong number of scores"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reranking failed, using vector scores");
                return;
            }
        };

        let RetrieverConfig {
            vector_weight,
            rerank_weight,
            ..
        } = self.config;

        results
            .par_iter_mut()
            .zip(scores.into_par_iter())
            .for_each(|(result, raw)| {
                let rerank_score = encoder.normalize(raw);
                result.rerank_score = Some(rerank_score);
                result.combined_score =
                    result.vector_score * vector_weight + rerank_score * rerank_weight;
            });
    }

    /// Passages closest to the stored record `id`, excluding the record
    /// itself. Unknown ids yield no results.
    pub fn get_similar_documents(&self, id: &str, n: usize) -> Vec<RetrievalResult> {
        if n == 0 {
            return Vec::new();
        }
        let Some(source) = self.store.get(id) else {
            tracing::debug!(id, "similar: source record not found");
            return Vec::new();
        };

        self.store
            .search(Query::Vector(&source.vector), n + 1, None)
            .into_hits()
            .into_iter()
            .filter(|hit| hit.id != id)
            .take(n)
            .map(|hit| RetrievalResult::from_hit(hit, self.config.include_embeddings))
            .collect()
    }

    /// Run [`retrieve`](Self::retrieve) for every query, in input order.
    pub fn batch_retrieve(
        &self,
        queries: &[String],
        n_results: usize,
        filter: Option<&Metadata>,
    ) -> Vec<(String, Vec<RetrievalResult>)> {
        queries
            .iter()
            .map(|query| (query.clone(), self.retrieve(query, n_results, filter)))
            .collect()
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("config", &self.config)
            .field("reranking", &self.reranking_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        control::CancelToken,
        embedding::HashingEmbedder,
        error::Error,
        reranker::LexicalCrossEncoder,
        vector_store::NewRecord,
    };

    const CORPUS: [&str; 3] = [
        "The quick brown fox jumps over the lazy dog.",
        "Rust is a systems programming language focused on safety.",
        "Bananas are an excellent source of potassium.",
    ];

    fn test_store() -> (tempfile::TempDir, Arc<VectorStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(
            tmp.path(),
            "retrieval",
            Arc::new(HashingEmbedder::new(384)),
        )
        .unwrap();
        let records = CORPUS
            .iter()
            .enumerate()
            .map(|(i, text)| NewRecord {
                text: text.to_string(),
                metadata: json!({"doc": i}).as_object().unwrap().clone(),
                vector: None,
            })
            .collect();
        store.add(records, 10, &CancelToken::new());
        (tmp, Arc::new(store))
    }

    fn lexical() -> Option<RerankerFactory> {
        Some(Box::new(|| {
            Ok(Arc::new(LexicalCrossEncoder) as Arc<dyn CrossEncoder>)
        }))
    }

    #[test]
    fn fox_query_ranks_fox_document_first() {
        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), lexical());
        assert!(retriever.reranking_active());

        let results = retriever.retrieve("fox jumping", 3, None);
        assert_eq!(results.len(), 3);
        assert!(results[0].text.contains("fox"));
        assert!(results[0].rerank_score.unwrap() > 0.0);
    }

    #[test]
    fn results_are_sorted_and_bounded() {
        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), lexical());

        let results = retriever.retrieve("programming language safety", 2, None);
        assert_eq!(results.len(), 2);
        for pair in results.windows(2) {
            assert!(pair[0].combined_score >= pair[1].combined_score);
        }
        for result in &results {
            let rerank = result.rerank_score.unwrap();
            let expected = result.vector_score * 0.4 + rerank * 0.6;
            assert!((result.combined_score - expected).abs() < 1e-5);
            assert!(result.embedding.is_none());
        }
    }

    #[test]
    fn without_reranking_combined_equals_vector_score() {
        let (_tmp, store) = test_store();
        let config = RetrieverConfig {
            use_reranking: false,
            include_embeddings: true,
            ..RetrieverConfig::default()
        };
        let retriever = Retriever::new(store, config, lexical());
        assert!(!retriever.reranking_active());

        let results = retriever.retrieve("bananas", 3, None);
        assert!(results[0].text.contains("Bananas"));
        for result in &results {
            assert_eq!(result.rerank_score, None);
            assert_eq!(result.combined_score, result.vector_score);
            assert_eq!(result.embedding.as_ref().unwrap().len(), 384);
        }
    }

    #[test]
    fn equal_scores_keep_store_order() {
        struct Constant;

        impl CrossEncoder for Constant {
            fn name(&self) -> &str {
                "constant"
            }
            fn score(&self, _query: &str, _text: &str) -> Result<f32> {
                Ok(0.0)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(
            tmp.path(),
            "ties",
            Arc::new(HashingEmbedder::new(64)),
        )
        .unwrap();
        let records = (0..4)
            .map(|i| NewRecord {
                text: "identical passage".to_string(),
                metadata: json!({"doc": i}).as_object().unwrap().clone(),
                vector: None,
            })
            .collect();
        let mut ids = store.add(records, 10, &CancelToken::new());
        ids.sort();
        let store = Arc::new(store);

        let plain = Retriever::new(
            Arc::clone(&store),
            RetrieverConfig {
                use_reranking: false,
                ..RetrieverConfig::default()
            },
            None,
        );
        let order: Vec<String> = plain
            .retrieve("identical passage", 4, None)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(order, ids);

        let factory: RerankerFactory =
            Box::new(|| Ok(Arc::new(Constant) as Arc<dyn CrossEncoder>));
        let reranked = Retriever::new(store, RetrieverConfig::default(), Some(factory));
        let results = reranked.retrieve("identical passage", 4, None);
        assert!(results.iter().all(|r| r.rerank_score == Some(0.5)));
        let order: Vec<String> = results.into_iter().map(|r| r.id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn per_call_rerank_opt_out() {
        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), lexical());

        let results = retriever.retrieve_with("fox", 3, None, false);
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[test]
    fn failing_factory_disables_reranking() {
        let (_tmp, store) = test_store();
        let factory: RerankerFactory =
            Box::new(|| Err(Error::Model("no weights".into())));
        let retriever =
            Retriever::new(store, RetrieverConfig::default(), Some(factory));

        assert!(!retriever.reranking_active());
        let results = retriever.retrieve("fox", 2, None);
        assert_eq!(results.len(), 2);
        assert!(results[0].rerank_score.is_none());
    }

    #[test]
    fn scoring_failure_falls_back_to_vector_order() {
        struct Broken;
        impl CrossEncoder for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn score(&self, _query: &str, _text: &str) -> Result<f32> {
                Err(Error::Model("offline".into()))
            }
        }

        let (_tmp, store) = test_store();
        let factory: RerankerFactory =
            Box::new(|| Ok(Arc::new(Broken) as Arc<dyn CrossEncoder>));
        let retriever =
            Retriever::new(store, RetrieverConfig::default(), Some(factory));

        let results = retriever.retrieve("quick brown fox", 3, None);
        assert_eq!(results.len(), 3);
        assert!(results[0].text.contains("fox"));
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[test]
    fn filter_restricts_candidates() {
        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), None);

        let filter = json!({"doc": 2}).as_object().unwrap().clone();
        let results = retriever.retrieve("fox", 5, Some(&filter));
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("Bananas"));
    }

    #[test]
    fn similar_documents_exclude_source() {
        let (_tmp, store) = test_store();
        let source = store
            .search(Query::Text("fox"), 1, None)
            .into_hits()
            .remove(0);
        let retriever =
            Retriever::new(Arc::clone(&store), RetrieverConfig::default(), None);

        let similar = retriever.get_similar_documents(&source.id, 5);
        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|r| r.id != source.id));

        assert!(retriever.get_similar_documents("missing", 3).is_empty());
    }

    #[test]
    fn batch_retrieve_keeps_query_order() {
        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), None);

        let queries = vec!["bananas".to_string(), "fox".to_string()];
        let batch = retriever.batch_retrieve(&queries, 1, None);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, "bananas");
        assert!(batch[0].1[0].text.contains("Bananas"));
        assert_eq!(batch[1].0, "fox");
        assert!(batch[1].1[0].text.contains("fox"));
    }

    #[test]
    fn expander_rewrites_query() {
        struct Synonyms;
        impl QueryExpander for Synonyms {
            fn expand(&self, query: &str) -> String {
                query.replace("fruit", "bananas potassium")
            }
        }

        let (_tmp, store) = test_store();
        let retriever = Retriever::new(store, RetrieverConfig::default(), None)
            .with_expander(Synonyms);
        let results = retriever.retrieve("fruit", 1, None);
        assert!(results[0].text.contains("Bananas"));
    }

    #[test]
    fn empty_store_returns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(
            tmp.path(),
            "empty",
            Arc::new(HashingEmbedder::new(32)),
        )
        .unwrap();
        let retriever =
            Retriever::new(Arc::new(store), RetrieverConfig::default(), lexical());
        assert!(retriever.retrieve("anything", 5, None).is_empty());
        assert!(retriever.retrieve("anything", 0, None).is_empty());
    }
}
