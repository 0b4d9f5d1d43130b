//! Sentence-aligned chunking of extracted document text.
//!
//! Sentences are accumulated into a buffer until the next one would push the
//! buffer's word count past the target size. The closed chunk then seeds the
//! next buffer with its trailing words so that context carries across the
//! boundary. A sentence is never split, so the target is a soft bound.

use serde_json::json;

use crate::{
    Metadata,
    error::{Error, Result},
    text_util::{split_into_sentences, word_count},
};

/// Default target chunk size, in words.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default number of words repeated at the start of the following chunk.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Chunk size and overlap, both measured in words.
///
/// # Examples
///
/// ```
/// use docrag::chunking::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.chunk_size, 1000);
/// assert_eq!(config.overlap, 200);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A chunk of text from a larger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Words in `text`, overlap included.
    pub word_count: usize,
}

impl Chunk {
    /// Chunker-derived metadata: `chunk_type` and `word_count`.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("chunk_type".into(), json!("text"));
        metadata.insert("word_count".into(), json!(self.word_count));
        metadata
    }
}

/// Split text into overlapping, sentence-aligned chunks.
///
/// Returns an empty vector for empty or whitespace-only input.
///
/// # Examples
///
/// ```
/// use docrag::chunking::chunk_text;
///
/// let chunks = chunk_text("Dr. Smith went home. He was tired. Then he slept.", 1000, 200);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].word_count, 9);
///
/// assert!(chunk_text("   ", 1000, 200).is_empty());
/// ```
pub fn chunk_text(
    text: &str,
    target_size: usize,
    overlap_size: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut buffered_words = 0;

    for sentence in split_into_sentences(text) {
        let sentence_words = word_count(&sentence);

        if !buffer.is_empty() && buffered_words + sentence_words > target_size
        {
            let closed = buffer.join(" ");
            let seed = trailing_words(&closed, overlap_size);
            chunks.push(Chunk {
                text: closed,
                word_count: buffered_words,
            });

            buffered_words = word_count(&seed);
            buffer.clear();
            if !seed.is_empty() {
                buffer.push(seed);
            }
        }

        buffer.push(sentence);
        buffered_words += sentence_words;
    }

    if !buffer.is_empty() {
        chunks.push(Chunk {
            text: buffer.join(" "),
            word_count: buffered_words,
        });
    }

    chunks
}

fn trailing_words(text: &str, count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    words[words.len().saturating_sub(count)..].join(" ")
}

/// Stable identifier of the chunk at `position` within a document.
///
/// ```
/// use docrag::chunking::chunk_id;
///
/// assert_eq!(chunk_id("file_00ab", 3), "file_00ab_chunk_3");
/// ```
pub fn chunk_id(file_id: &str, position: usize) -> String {
    format!("{file_id}_chunk_{position}")
}
