use std::{sync::Arc, time::Duration};

use candle_core::Tensor;
use rayon::prelude::*;

use crate::{
    control::run_with_timeout,
    error::{Error, Result},
    model_manager::SharedModel,
};

/// Scores how well `text` answers `query`.
///
/// Raw scores may be unbounded; [`normalize`](CrossEncoder::normalize) maps
/// them into `[0, 1]` so they can be fused with vector similarity.
pub trait CrossEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// Score several candidates against one query, preserving input order.
    fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        texts
            .par_iter()
            .map(|text| self.score(query, text))
            .collect()
    }

    /// Map a raw score into `[0, 1]`. Defaults to the logistic function.
    fn normalize(&self, raw: f32) -> f32 {
        sigmoid(raw)
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// -- ColBERT MaxSim --

/// Late-interaction reranker: the score is the ColBERT MaxSim between the
/// query and candidate token embeddings, averaged over query tokens so it
/// stays within `[-1, 1]` for unit-length embeddings.
pub struct ColbertReranker {
    model: SharedModel,
}

impl ColbertReranker {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    fn encode_query(&self, query: &str) -> Result<Tensor> {
        self.model
            .lock()
            .map_err(|_| Error::Model("model lock poisoned".to_string()))?
            .encode_query(query)
    }

    fn encode_document(&self, text: &str) -> Result<Tensor> {
        let batch = self
            .model
            .lock()
            .map_err(|_| Error::Model("model lock poisoned".to_string()))?
            .encode_documents(&[text.to_string()])?;
        Ok(batch.get(0)?)
    }
}

impl CrossEncoder for ColbertReranker {
    fn name(&self) -> &str {
        "colbert-maxsim"
    }

    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let query_embedding = self.encode_query(query)?;
        let doc_embedding = self.encode_document(text)?;
        mean_maxsim(&query_embedding, &doc_embedding)
    }

    fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let query_embedding = self.encode_query(query)?;
        texts
            .iter()
            .map(|text| {
                let doc_embedding = self.encode_document(text)?;
                mean_maxsim(&query_embedding, &doc_embedding)
            })
            .collect()
    }

    fn normalize(&self, raw: f32) -> f32 {
        ((raw + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

/// MaxSim divided by the number of query tokens.
fn mean_maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    let (query_tokens, _) = query_embedding.dims2()?;
    if query_tokens == 0 {
        return Err(Error::Model("query has no token embeddings".to_string()));
    }
    Ok(maxsim(query_embedding, doc_embedding)? / query_tokens as f32)
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // [Q, T] = query_emb @ doc_emb^T
    let sim_matrix = query_embedding.matmul(&doc_embedding.t()?)?;

    // Best document token per query token
    let row_maxes = sim_matrix.max(1)?;

    Ok(row_maxes.sum_all()?.to_scalar::<f32>()?)
}

// -- Lexical --

/// Model-free cross-encoder: the fraction of distinct query terms that occur
/// in the candidate text. Already in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct LexicalCrossEncoder;

fn terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

impl CrossEncoder for LexicalCrossEncoder {
    fn name(&self) -> &str {
        "lexical"
    }

    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Err(Error::Model("query has no terms".to_string()));
        }
        let text_terms = terms(text);
        let matched = query_terms
            .iter()
            .filter(|t| text_terms.binary_search(t).is_ok())
            .count();
        Ok(matched as f32 / query_terms.len() as f32)
    }

    fn normalize(&self, raw: f32) -> f32 {
        raw.clamp(0.0, 1.0)
    }
}

// -- Timeouts --

/// Bounds every scoring call of the wrapped cross-encoder by `timeout`.
pub struct TimedCrossEncoder {
    inner: Arc<dyn CrossEncoder>,
    timeout: Duration,
}

impl TimedCrossEncoder {
    pub fn new(inner: Arc<dyn CrossEncoder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl CrossEncoder for TimedCrossEncoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let inner = Arc::clone(&self.inner);
        let (query, text) = (query.to_string(), text.to_string());
        run_with_timeout("rerank", self.timeout, move || {
            inner.score(&query, &text)
        })
    }

    fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let (query, texts) = (query.to_string(), texts.to_vec());
        run_with_timeout("rerank", self.timeout, move || {
            inner.score_batch(&query, &texts)
        })
    }

    fn normalize(&self, raw: f32) -> f32 {
        self.inner.normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn make_tensor(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn maxsim_identical_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn maxsim_orthogonal_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[0.0, 1.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!(score.abs() < 1e-6);
    }

    #[test]
    fn mean_maxsim_averages_over_query_tokens() {
        // q[0] best matches d[0] (1.0), q[1] best matches d[1] (1.0)
        let q = make_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let d = make_tensor(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], (3, 2));
        assert!((maxsim(&q, &d).unwrap() - 2.0).abs() < 1e-6);
        assert!((mean_maxsim(&q, &d).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn colbert_normalization_is_linear() {
        let reranker = ColbertReranker::new(
            crate::model_manager::ModelManager::with_model_id("unused".into())
                .shared(),
        );
        assert_eq!(reranker.normalize(-1.0), 0.0);
        assert_eq!(reranker.normalize(1.0), 1.0);
        assert!((reranker.normalize(0.0) - 0.5).abs() < 1e-6);
        assert_eq!(reranker.normalize(3.0), 1.0);
    }

    #[test]
    fn default_normalization_is_sigmoid() {
        struct Raw;
        impl CrossEncoder for Raw {
            fn name(&self) -> &str {
                "raw"
            }
            fn score(&self, _query: &str, text: &str) -> Result<f32> {
                Ok(text.len() as f32)
            }
        }

        let raw = Raw;
        assert!((raw.normalize(0.0) - 0.5).abs() < 1e-6);
        assert!(raw.normalize(10.0) > 0.99);
        assert!(raw.normalize(-10.0) < 0.01);

        let scores = raw
            .score_batch("q", &["a".into(), "abc".into(), "ab".into()])
            .unwrap();
        assert_eq!(scores, vec![1.0, 3.0, 2.0]);
    }

    #[test]
    fn lexical_scores_term_overlap() {
        let encoder = LexicalCrossEncoder;
        let full = encoder.score("brown fox", "The quick brown fox.").unwrap();
        let half = encoder.score("brown fox", "A brown bear.").unwrap();
        let none = encoder.score("brown fox", "Nothing here.").unwrap();

        assert_eq!(full, 1.0);
        assert_eq!(half, 0.5);
        assert_eq!(none, 0.0);
        assert!(encoder.score("!!", "text").is_err());
    }

    #[test]
    fn timed_cross_encoder_delegates() {
        let timed = TimedCrossEncoder::new(
            Arc::new(LexicalCrossEncoder),
            Duration::from_secs(5),
        );
        let scores = timed
            .score_batch("fox", &["a fox".into(), "a dog".into()])
            .unwrap();
        assert_eq!(scores, vec![1.0, 0.0]);
        assert_eq!(timed.normalize(2.0), 1.0);
    }
}
