//! Persistent vector store backed by redb.
//!
//! One database file per collection holds three tables:
//!
//! - `records`: id -> JSON `{text, metadata}`
//! - `vectors`: id -> 4-byte LE dimension header followed by LE f32 values
//! - `meta`: collection-wide values such as the vector dimension
//!
//! Search is brute-force cosine similarity over every stored vector.
//! Operations catch their own errors, log them, and report failure through
//! their return value; the `try_*` variants return the typed error instead.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rayon::prelude::*;
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Metadata,
    control::CancelToken,
    embedding::Embedder,
    error::{Error, Result},
};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const VECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const DIMENSION_KEY: &str = "dimension";

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Default number of records written per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A record to insert. When `vector` is `None` the store embeds `text`.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub text: String,
    pub metadata: Metadata,
    pub vector: Option<Vec<f32>>,
}

/// A stored record. The id is assigned by the store on insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    text: String,
    metadata: Metadata,
}

/// What to search for.
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    /// Embedded with [`Embedder::embed_query`] before searching.
    Text(&'a str),
    Vector(&'a [f32]),
}

/// A single nearest-neighbour match.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Cosine distance in `[0, 2]`.
    pub distance: f32,
    /// `1 - distance / 2`, in `[0, 1]`.
    pub similarity: f32,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

/// Result of a search, keeping provider failures apart from empty results.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Found(Vec<SearchHit>),
    NoMatch,
    Failed { cause: String },
}

impl SearchOutcome {
    /// Hits, with failures collapsed into an empty list.
    pub fn into_hits(self) -> Vec<SearchHit> {
        match self {
            Self::Found(hits) => hits,
            Self::NoMatch | Self::Failed { .. } => Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Convert every non-scalar metadata value (arrays, objects, null) into its
/// JSON string form.
pub fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                    value.clone()
                }
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    Value::String(value.to_string())
                }
            };
            (key.clone(), value)
        })
        .collect()
}

/// Cosine distance between two vectors, `None` on length mismatch or when
/// either vector holds a non-finite value.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(1.0);
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    if !cosine.is_finite() {
        return None;
    }
    Some((1.0 - cosine).clamp(0.0, 2.0))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + size_of_val(vector));
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let data = &bytes[HEADER_SIZE..];
    if data.len() != dimension * size_of::<f32>() {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(data))
}

pub struct VectorStore {
    db: Database,
    collection: String,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl VectorStore {
    /// Open or create the collection stored at `<dir>/<collection>.redb`.
    pub fn open(
        dir: &Path,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let path = dir.join(format!("{collection}.redb"));
        let db = Database::create(&path).map_err(redb::Error::from)?;

        let txn = db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.open_table(VECTORS)?;
        txn.open_table(META)?;
        txn.commit()?;

        tracing::debug!(collection, path = %path.display(), "opened vector store");

        Ok(Self {
            db,
            collection: collection.to_string(),
            path,
            embedder,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Vector dimension fixed by the first insertion, if any.
    pub fn dimension(&self) -> Result<Option<usize>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(DIMENSION_KEY)?.map(|v| v.value() as usize))
    }

    // -- Writes --

    /// Insert records in batches of `batch_size`, returning the ids that
    /// were written.
    ///
    /// Records that fail to embed, or whose vector does not match the
    /// collection dimension, are skipped. Each batch is written in a single
    /// transaction; a batch that fails to write is skipped as a whole while
    /// earlier batches stay persisted. `cancel` is checked before each batch.
    pub fn add(
        &self,
        records: Vec<NewRecord>,
        batch_size: usize,
        cancel: &CancelToken,
    ) -> Vec<String> {
        let batch_size = batch_size.max(1);
        let total = records.len();
        let mut ids = Vec::with_capacity(total);
        let mut pending = records.into_iter().peekable();
        let mut batch_index = 0;

        while pending.peek().is_some() {
            if cancel.is_cancelled() {
                tracing::info!(
                    collection = %self.collection,
                    written = ids.len(),
                    total,
                    "add cancelled"
                );
                break;
            }

            let batch: Vec<NewRecord> = pending.by_ref().take(batch_size).collect();
            let prepared = self.prepare_batch(batch);

            match self.write_batch(&prepared) {
                Ok(written) => ids.extend(written),
                Err(e) => {
                    let e = Error::StoreWrite(e.to_string());
                    tracing::warn!(
                        collection = %self.collection,
                        batch = batch_index,
                        size = prepared.len(),
                        "{e}"
                    );
                }
            }
            batch_index += 1;
        }

        tracing::debug!(
            collection = %self.collection,
            written = ids.len(),
            total,
            "added records"
        );
        ids
    }

    /// Embed the texts lacking a vector and drop the records that fail.
    fn prepare_batch(
        &self,
        batch: Vec<NewRecord>,
    ) -> Vec<(String, Metadata, Vec<f32>)> {
        let to_embed: Vec<String> = batch
            .iter()
            .filter(|r| r.vector.is_none())
            .map(|r| r.text.clone())
            .collect();
        let mut embedded = if to_embed.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_many(&to_embed)
        }
        .into_iter();

        let mut prepared = Vec::with_capacity(batch.len());
        for record in batch {
            let vector = match record.vector {
                Some(vector) => Ok(vector),
                None => embedded.next().unwrap_or_else(|| {
                    Err(Error::Embedding(
                        "embedder returned fewer vectors than texts".into(),
                    ))
                }),
            };
            match vector {
                Ok(vector) if !vector.is_empty() => prepared.push((
                    record.text,
                    sanitize_metadata(&record.metadata),
                    vector,
                )),
                Ok(_) => tracing::warn!("skipping record with empty vector"),
                Err(e) => tracing::warn!(error = %e, "skipping record"),
            }
        }
        prepared
    }

    fn write_batch(
        &self,
        batch: &[(String, Metadata, Vec<f32>)],
    ) -> Result<Vec<String>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_write()?;
        let mut ids = Vec::with_capacity(batch.len());
        {
            let mut meta = txn.open_table(META)?;
            let mut dimension =
                meta.get(DIMENSION_KEY)?.map(|v| v.value() as usize);

            let mut records = txn.open_table(RECORDS)?;
            let mut vectors = txn.open_table(VECTORS)?;

            for (text, metadata, vector) in batch {
                match dimension {
                    Some(d) if d != vector.len() => {
                        tracing::warn!(
                            expected = d,
                            actual = vector.len(),
                            "skipping record with mismatched dimension"
                        );
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        meta.insert(DIMENSION_KEY, vector.len() as u64)?;
                        dimension = Some(vector.len());
                    }
                }

                let id = uuid::Uuid::new_v4().to_string();
                let stored = serde_json::to_vec(&StoredRecord {
                    text: text.clone(),
                    metadata: metadata.clone(),
                })?;
                records.insert(id.as_str(), stored.as_slice())?;
                vectors.insert(id.as_str(), encode_vector(vector).as_slice())?;
                ids.push(id);
            }
        }
        txn.commit()?;

        Ok(ids)
    }

    /// Replace the text, metadata and vector of an existing record.
    pub fn update(&self, id: &str, text: &str, metadata: &Metadata) -> bool {
        match self.try_update(id, text, metadata) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(id, error = %e, "update failed");
                false
            }
        }
    }

    pub fn try_update(
        &self,
        id: &str,
        text: &str,
        metadata: &Metadata,
    ) -> Result<bool> {
        if self.try_get(id)?.is_none() {
            return Ok(false);
        }

        let vector = self.embedder.embed(text)?;
        if let Some(d) = self.dimension()?
            && d != vector.len()
        {
            return Err(Error::StoreWrite(format!(
                "vector dimension {} does not match collection dimension {d}",
                vector.len()
            )));
        }

        let stored = serde_json::to_vec(&StoredRecord {
            text: text.to_string(),
            metadata: sanitize_metadata(metadata),
        })?;

        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(RECORDS)?;
            let mut vectors = txn.open_table(VECTORS)?;
            records.insert(id, stored.as_slice())?;
            vectors.insert(id, encode_vector(&vector).as_slice())?;
        }
        txn.commit()?;
        Ok(true)
    }

    /// Remove records by id. Returns `false` for an empty id list or on
    /// failure.
    pub fn delete(&self, ids: &[String]) -> bool {
        if ids.is_empty() {
            return false;
        }
        match self.try_delete(ids) {
            Ok(removed) => {
                tracing::debug!(requested = ids.len(), removed, "deleted records");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "delete failed");
                false
            }
        }
    }

    /// Remove records by id, returning how many existed.
    pub fn try_delete(&self, ids: &[String]) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut records = txn.open_table(RECORDS)?;
            let mut vectors = txn.open_table(VECTORS)?;
            for id in ids {
                if records.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
                vectors.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Remove every record whose metadata satisfies `matches`, returning how
    /// many were removed.
    pub fn try_delete_where<F>(&self, matches: F) -> Result<usize>
    where
        F: Fn(&Metadata) -> bool,
    {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut records = txn.open_table(RECORDS)?;
            let mut vectors = txn.open_table(VECTORS)?;

            let mut doomed = Vec::new();
            for entry in records.iter()? {
                let (key, value) = entry?;
                let stored: StoredRecord = serde_json::from_slice(value.value())?;
                if matches(&stored.metadata) {
                    doomed.push(key.value().to_string());
                }
            }
            for id in &doomed {
                records.remove(id.as_str())?;
                vectors.remove(id.as_str())?;
            }
            doomed.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Drop every record. Irreversible.
    pub fn clear(&self) -> bool {
        match self.try_clear() {
            Ok(()) => {
                tracing::info!(collection = %self.collection, "cleared vector store");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "clear failed");
                false
            }
        }
    }

    pub fn try_clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(RECORDS)?;
        txn.delete_table(VECTORS)?;
        txn.delete_table(META)?;
        txn.open_table(RECORDS)?;
        txn.open_table(VECTORS)?;
        txn.open_table(META)?;
        txn.commit()?;
        Ok(())
    }

    // -- Reads --

    pub fn get(&self, id: &str) -> Option<VectorRecord> {
        self.try_get(id).unwrap_or_else(|e| {
            tracing::warn!(id, error = %e, "get failed");
            None
        })
    }

    pub fn try_get(&self, id: &str) -> Result<Option<VectorRecord>> {
        let txn = self.db.begin_read()?;
        let records = txn.open_table(RECORDS)?;
        let vectors = txn.open_table(VECTORS)?;

        let Some(record) = records.get(id)? else {
            return Ok(None);
        };
        let stored: StoredRecord = serde_json::from_slice(record.value())?;
        let vector = vectors
            .get(id)?
            .and_then(|v| decode_vector(v.value()))
            .ok_or_else(|| {
                Error::StoreQuery(format!("record {id} has no readable vector"))
            })?;

        Ok(Some(VectorRecord {
            id: id.to_string(),
            text: stored.text,
            metadata: stored.metadata,
            vector,
        }))
    }

    /// Number of stored records; `0` on failure.
    pub fn count(&self) -> usize {
        self.try_count().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "count failed");
            0
        })
    }

    pub fn try_count(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        Ok(table.len()? as usize)
    }

    /// Nearest neighbours of `query`, optionally restricted to records whose
    /// metadata contains every key/value pair of `filter`.
    ///
    /// Hits are ordered by descending similarity; ties keep store order.
    pub fn search(
        &self,
        query: Query<'_>,
        k: usize,
        filter: Option<&Metadata>,
    ) -> SearchOutcome {
        if k == 0 {
            return SearchOutcome::NoMatch;
        }
        match self.try_search(query, k, filter) {
            Ok(hits) if hits.is_empty() => SearchOutcome::NoMatch,
            Ok(hits) => SearchOutcome::Found(hits),
            Err(e) => {
                let e = Error::StoreQuery(e.to_string());
                tracing::warn!(collection = %self.collection, "{e}");
                SearchOutcome::Failed {
                    cause: e.to_string(),
                }
            }
        }
    }

    fn try_search(
        &self,
        query: Query<'_>,
        k: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>> {
        let embedded;
        let query_vector = match query {
            Query::Vector(v) => v,
            Query::Text(text) => {
                embedded = self.embedder.embed_query(text)?;
                embedded.as_slice()
            }
        };

        let candidates = self.load_candidates(filter)?;

        let mut hits: Vec<SearchHit> = candidates
            .into_par_iter()
            .filter_map(|(id, stored, vector)| {
                let distance = cosine_distance(query_vector, &vector)?;
                Some(SearchHit {
                    id,
                    text: stored.text,
                    metadata: stored.metadata,
                    distance,
                    similarity: 1.0 - distance / 2.0,
                    vector,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);

        Ok(hits)
    }

    fn load_candidates(
        &self,
        filter: Option<&Metadata>,
    ) -> Result<Vec<(String, StoredRecord, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let records = txn.open_table(RECORDS)?;
        let vectors = txn.open_table(VECTORS)?;

        let mut candidates = Vec::new();
        for entry in records.iter()? {
            let (key, value) = entry?;
            let stored: StoredRecord = serde_json::from_slice(value.value())?;

            if let Some(filter) = filter
                && !filter
                    .iter()
                    .all(|(k, v)| stored.metadata.get(k) == Some(v))
            {
                continue;
            }

            let id = key.value().to_string();
            let Some(vector) =
                vectors.get(id.as_str())?.and_then(|v| decode_vector(v.value()))
            else {
                tracing::warn!(id, "record has no readable vector, skipping");
                continue;
            };
            candidates.push((id, stored, vector));
        }

        Ok(candidates)
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}
