//! Pipeline settings resolved from [`ConfigDb`] with built-in defaults.

use std::{str::FromStr, time::Duration};

use serde::Serialize;

use crate::{
    chunking::ChunkingConfig,
    config_db::ConfigDb,
    error::{Error, Result},
    model_manager::DEFAULT_MODEL_ID,
    retriever::RetrieverConfig,
};

/// Which embedder implementation backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Colbert,
    Hashing,
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "colbert" => Ok(Self::Colbert),
            "hashing" => Ok(Self::Hashing),
            other => Err(Error::Config(format!(
                "unknown embedder '{other}' (expected 'colbert' or 'hashing')"
            ))),
        }
    }
}

/// Setting keys understood by [`PipelineConfig::load`], with their defaults.
pub const SETTINGS: &[(&str, &str)] = &[
    ("collection", "documents"),
    ("chunk_size", "1000"),
    ("chunk_overlap", "200"),
    ("batch_size", "100"),
    ("retrieval_top_k", "50"),
    ("rerank_top_k", "5"),
    ("use_reranking", "true"),
    ("vector_weight", "0.4"),
    ("rerank_weight", "0.6"),
    ("use_cache", "true"),
    ("embedder", "colbert"),
    ("model", DEFAULT_MODEL_ID),
    ("hashing_dimension", "384"),
    ("embed_timeout_secs", "120"),
];

/// Returns the default for a known setting key.
pub fn default_for(key: &str) -> Option<&'static str> {
    SETTINGS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub batch_size: usize,
    pub retrieval_top_k: usize,
    pub rerank_top_k: usize,
    pub use_reranking: bool,
    pub vector_weight: f32,
    pub rerank_weight: f32,
    pub use_cache: bool,
    pub embedder: EmbedderKind,
    pub model: String,
    pub hashing_dimension: usize,
    pub embed_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: "documents".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            batch_size: 100,
            retrieval_top_k: 50,
            rerank_top_k: 5,
            use_reranking: true,
            vector_weight: 0.4,
            rerank_weight: 0.6,
            use_cache: true,
            embedder: EmbedderKind::Colbert,
            model: DEFAULT_MODEL_ID.to_string(),
            hashing_dimension: 384,
            embed_timeout_secs: 120,
        }
    }
}

impl PipelineConfig {
    /// Read every known setting from `db`, falling back to defaults.
    pub fn load(db: &ConfigDb) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            db.get_setting_or(key, default_for(key).unwrap_or_default())
        };

        let config = Self {
            collection: get("collection")?,
            chunk_size: parse("chunk_size", &get("chunk_size")?)?,
            chunk_overlap: parse("chunk_overlap", &get("chunk_overlap")?)?,
            batch_size: parse("batch_size", &get("batch_size")?)?,
            retrieval_top_k: parse(
                "retrieval_top_k",
                &get("retrieval_top_k")?,
            )?,
            rerank_top_k: parse("rerank_top_k", &get("rerank_top_k")?)?,
            use_reranking: parse("use_reranking", &get("use_reranking")?)?,
            vector_weight: parse("vector_weight", &get("vector_weight")?)?,
            rerank_weight: parse("rerank_weight", &get("rerank_weight")?)?,
            use_cache: parse("use_cache", &get("use_cache")?)?,
            embedder: get("embedder")?.parse()?,
            model: get("model")?,
            hashing_dimension: parse(
                "hashing_dimension",
                &get("hashing_dimension")?,
            )?,
            embed_timeout_secs: parse(
                "embed_timeout_secs",
                &get("embed_timeout_secs")?,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty()
            || !self
                .collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Config(format!(
                "invalid collection name '{}'",
                self.collection
            )));
        }
        self.chunking().validate()?;
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.hashing_dimension == 0 {
            return Err(Error::Config(
                "hashing_dimension must be positive".into(),
            ));
        }
        if self.vector_weight < 0.0 || self.rerank_weight < 0.0 {
            return Err(Error::Config(
                "score weights must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            overlap: self.chunk_overlap,
        }
    }

    pub fn retriever(&self) -> RetrieverConfig {
        RetrieverConfig {
            retrieval_top_k: self.retrieval_top_k,
            use_reranking: self.use_reranking,
            vector_weight: self.vector_weight,
            rerank_weight: self.rerank_weight,
            ..RetrieverConfig::default()
        }
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        Error::Config(format!("invalid value '{value}' for '{key}': {e}"))
    })
}

/// Check that `value` is acceptable for `key` before persisting it.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    if default_for(key).is_none() {
        return Err(Error::Config(format!("unknown setting '{key}'")));
    }

    let mut config = PipelineConfig::default();
    match key {
        "collection" => config.collection = value.to_string(),
        "chunk_size" => config.chunk_size = parse(key, value)?,
        "chunk_overlap" => config.chunk_overlap = parse(key, value)?,
        "batch_size" => config.batch_size = parse(key, value)?,
        "retrieval_top_k" => config.retrieval_top_k = parse(key, value)?,
        "rerank_top_k" => config.rerank_top_k = parse(key, value)?,
        "use_reranking" => config.use_reranking = parse(key, value)?,
        "vector_weight" => config.vector_weight = parse(key, value)?,
        "rerank_weight" => config.rerank_weight = parse(key, value)?,
        "use_cache" => config.use_cache = parse(key, value)?,
        "embedder" => config.embedder = value.parse()?,
        "hashing_dimension" => config.hashing_dimension = parse(key, value)?,
        "embed_timeout_secs" => config.embed_timeout_secs = parse(key, value)?,
        _ => {}
    }

    // chunk_size and chunk_overlap are validated jointly on load.
    if key == "chunk_size" || key == "chunk_overlap" {
        return Ok(());
    }
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_when_nothing_stored() {
        let (_tmp, db) = test_db();
        let config = PipelineConfig::load(&db).unwrap();

        assert_eq!(config.collection, "documents");
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retrieval_top_k, 50);
        assert_eq!(config.rerank_top_k, 5);
        assert!(config.use_reranking);
        assert!((config.vector_weight - 0.4).abs() < f32::EPSILON);
        assert!((config.rerank_weight - 0.6).abs() < f32::EPSILON);
        assert!(config.use_cache);
        assert_eq!(config.embedder, EmbedderKind::Colbert);
        assert_eq!(config.model, DEFAULT_MODEL_ID);
    }

    #[test]
    fn stored_settings_override_defaults() {
        let (_tmp, db) = test_db();
        db.set_setting("chunk_size", "300").unwrap();
        db.set_setting("chunk_overlap", "50").unwrap();
        db.set_setting("embedder", "hashing").unwrap();
        db.set_setting("use_cache", "false").unwrap();

        let config = PipelineConfig::load(&db).unwrap();
        assert_eq!(config.chunk_size, 300);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.embedder, EmbedderKind::Hashing);
        assert!(!config.use_cache);
    }

    #[test]
    fn overlap_not_below_size_is_rejected() {
        let (_tmp, db) = test_db();
        db.set_setting("chunk_size", "100").unwrap();
        db.set_setting("chunk_overlap", "100").unwrap();

        assert!(matches!(PipelineConfig::load(&db), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_number_is_config_error() {
        let (_tmp, db) = test_db();
        db.set_setting("batch_size", "many").unwrap();

        let err = PipelineConfig::load(&db).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn validate_setting_checks_keys_and_values() {
        assert!(validate_setting("retrieval_top_k", "20").is_ok());
        assert!(validate_setting("embedder", "hashing").is_ok());
        assert!(validate_setting("embedder", "word2vec").is_err());
        assert!(validate_setting("batch_size", "0").is_err());
        assert!(validate_setting("collection", "../etc").is_err());
        assert!(validate_setting("no_such_key", "1").is_err());
    }
}
