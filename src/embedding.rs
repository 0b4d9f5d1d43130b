//! Text embedders: the [`Embedder`] trait and its implementations.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use crate::{
    control::run_with_timeout,
    error::{Error, Result},
    model_manager::{ModelManager, SharedModel},
};

/// Maps text to a fixed-dimension vector.
///
/// Every vector an embedder returns has the same length, reported by
/// [`dimensions`](Embedder::dimensions).
pub trait Embedder: Send + Sync {
    /// Short identifier shown in status output.
    fn name(&self) -> &str;

    fn dimensions(&self) -> Result<usize>;

    /// Embed a passage for storage.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a search query. Defaults to [`embed`](Embedder::embed).
    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query)
    }

    /// Embed several passages. One failure never affects the other results.
    fn embed_many(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dimensions(&self) -> Result<usize> {
        (**self).dimensions()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        (**self).embed_query(query)
    }

    fn embed_many(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        (**self).embed_many(texts)
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

// -- Feature hashing --

/// Deterministic, model-free embedder based on signed feature hashing.
///
/// Each lower-cased word contributes one feature and each of its character
/// trigrams a half-weight feature, so related word forms ("jumps",
/// "jumping") land close together. Useful offline and in tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let value = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
            bytes[6], bytes[7],
        ]);
        let index = (value % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> Result<usize> {
        Ok(self.dimension)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; self.dimension];
        let mut features = 0usize;

        let lower = text.to_lowercase();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, &format!("w:{word}"), 1.0);
            features += 1;

            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                self.add_feature(&mut vector, &format!("t:{trigram}"), 0.5);
            }
        }

        if features == 0 {
            return Err(Error::Embedding(
                "text contains no embeddable tokens".to_string(),
            ));
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

// -- ColBERT --

/// Single-vector embeddings from a ColBERT model: token embeddings are
/// mean-pooled and normalised to unit length.
pub struct ColbertEmbedder {
    model: SharedModel,
    dimension: OnceLock<usize>,
}

impl ColbertEmbedder {
    pub fn new(model: SharedModel) -> Self {
        Self {
            model,
            dimension: OnceLock::new(),
        }
    }

    pub fn model_id(&self) -> String {
        self.model
            .lock()
            .map(|m| m.model_id().to_string())
            .unwrap_or_default()
    }

    fn with_model<T>(
        &self,
        f: impl FnOnce(&mut ModelManager) -> Result<T>,
    ) -> Result<T> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Model("model lock poisoned".to_string()))?;
        f(&mut model)
    }

    fn pooled(&self, tokens: candle_core::Tensor) -> Result<Vec<f32>> {
        // [T, D] -> [D]
        let mut vector = tokens.mean(0)?.to_vec1::<f32>()?;
        l2_normalize(&mut vector);
        let _ = self.dimension.set(vector.len());
        Ok(vector)
    }
}

impl Embedder for ColbertEmbedder {
    fn name(&self) -> &str {
        "colbert"
    }

    fn dimensions(&self) -> Result<usize> {
        if let Some(dimension) = self.dimension.get() {
            return Ok(*dimension);
        }
        Ok(self.embed("dimension probe")?.len())
    }

    // Texts are encoded one at a time so padding never enters the mean.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self.with_model(|model| {
            let batch = model.encode_documents(&[text.to_string()])?;
            Ok(batch.get(0)?)
        })?;
        self.pooled(tokens)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let tokens = self.with_model(|model| model.encode_query(query))?;
        self.pooled(tokens)
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder").finish_non_exhaustive()
    }
}

// -- Timeouts --

/// Bounds every call to the wrapped embedder by `timeout`.
pub struct TimedEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
}

impl TimedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Embedder for TimedEmbedder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        run_with_timeout("embed", self.timeout, move || inner.dimensions())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        run_with_timeout("embed", self.timeout, move || inner.embed(&text))
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let query = query.to_string();
        run_with_timeout("embed", self.timeout, move || {
            inner.embed_query(&query)
        })
    }

    // `embed_many` stays on the default: one timeout per text.
}

impl std::fmt::Debug for TimedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedEmbedder")
            .field("embedder", &self.inner.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    /// Embedder that fails for any text containing `"FAIL"`.
    pub(crate) struct FlakyEmbedder(pub HashingEmbedder);

    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> Result<usize> {
            self.0.dimensions()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("FAIL") {
                return Err(Error::Embedding("refusing to embed".into()));
            }
            self.0.embed(text)
        }
    }

    struct SlowEmbedder;

    impl Embedder for SlowEmbedder {
        fn name(&self) -> &str {
            "slow"
        }

        fn dimensions(&self) -> Result<usize> {
            Ok(2)
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![1.0, 0.0])
        }
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("The quick brown fox").unwrap();
        let b = embedder.embed("The quick brown fox").unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_related_text_scores_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed_query("fox jumping").unwrap();
        let fox = embedder
            .embed("The quick brown fox jumps over the lazy dog.")
            .unwrap();
        let other = embedder
            .embed("Databases store records in tables.")
            .unwrap();

        assert!(cosine(&query, &fox) > cosine(&query, &other));
    }

    #[test]
    fn hashing_rejects_text_without_tokens() {
        let embedder = HashingEmbedder::new(16);
        assert!(matches!(
            embedder.embed("  ... !!"),
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn embed_many_isolates_failures() {
        let embedder = FlakyEmbedder(HashingEmbedder::new(32));
        let texts = vec![
            "first text".to_string(),
            "FAIL here".to_string(),
            "third text".to_string(),
        ];
        let results = embedder.embed_many(&texts);

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().len(), 32);
    }

    #[test]
    fn timed_embedder_passes_through_fast_calls() {
        let inner: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(8));
        let timed = TimedEmbedder::new(inner, Duration::from_secs(5));
        assert_eq!(timed.embed("hello").unwrap().len(), 8);
        assert_eq!(timed.dimensions().unwrap(), 8);
    }

    #[test]
    fn timed_embedder_times_out() {
        let timed =
            TimedEmbedder::new(Arc::new(SlowEmbedder), Duration::from_millis(20));

        assert!(matches!(timed.embed("x"), Err(Error::Timeout { .. })));

        let results = timed.embed_many(&["a".to_string(), "b".to_string()]);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_err));
    }

    /// Takes 80 ms per text: fine alone, too slow for a whole batch.
    struct PerItemSlowEmbedder;

    impl Embedder for PerItemSlowEmbedder {
        fn name(&self) -> &str {
            "per-item-slow"
        }

        fn dimensions(&self) -> Result<usize> {
            Ok(2)
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(80));
            Ok(vec![0.0, 1.0])
        }
    }

    #[test]
    fn timed_embed_many_bounds_each_text() {
        let timed = TimedEmbedder::new(
            Arc::new(PerItemSlowEmbedder),
            Duration::from_millis(250),
        );
        let texts: Vec<String> =
            (0..4).map(|i| format!("text {i}")).collect();

        let results = timed.embed_many(&texts);

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(Result::is_ok));
    }

    #[test]
    fn l2_normalize_handles_zero() {
        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);

        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
