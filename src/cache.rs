//! On-disk cache of processing results, one JSON file per fingerprint.
//!
//! A fingerprint covers the file name, size, modification time (whole
//! seconds) and the caller metadata, so editing a file or passing different
//! metadata forces reprocessing. Entries never expire on their own.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{
    Metadata,
    error::{Error, Result},
    processor::{ProcessingResult, ProcessingStatus},
};

pub struct ProcessingCache {
    dir: PathBuf,
}

impl ProcessingCache {
    /// Use `dir` as the cache directory, creating it if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::CacheIo(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key of `path` processed with `metadata`.
    pub fn fingerprint(path: &Path, metadata: &Metadata) -> Result<String> {
        let stat = std::fs::metadata(path)?;
        let mtime = stat
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // serde_json::Map keeps keys sorted.
        let metadata = serde_json::to_string(metadata)?;
        let key = format!("{name}_{}_{mtime}_{metadata}", stat.len());
        Ok(blake3::hash(key.as_bytes()).to_hex().to_string())
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Cached result for `fingerprint`. Unreadable entries count as misses.
    pub fn get(&self, fingerprint: &str) -> Option<ProcessingResult> {
        let path = self.entry_path(fingerprint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                let e = Error::CacheIo(format!("{}: {e}", path.display()));
                tracing::warn!("{e}");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache entry");
                None
            }
        }
    }

    /// Store `result` under `fingerprint`. Failures are logged and ignored.
    pub fn put(&self, fingerprint: &str, result: &ProcessingResult) {
        let path = self.entry_path(fingerprint);
        let written = serde_json::to_vec(result)
            .map_err(Error::from)
            .and_then(|bytes| Ok(std::fs::write(&path, bytes)?));
        if let Err(e) = written {
            let e = Error::CacheIo(format!("{}: {e}", path.display()));
            tracing::warn!("{e}");
        }
    }

    /// Return the cached result for `path` unless `force` is set; otherwise
    /// run `process` and cache its result when it succeeded.
    pub fn get_or_process<F>(
        &self,
        path: &Path,
        metadata: &Metadata,
        force: bool,
        process: F,
    ) -> Result<ProcessingResult>
    where
        F: FnOnce() -> ProcessingResult,
    {
        let fingerprint = Self::fingerprint(path, metadata)?;

        if !force && let Some(cached) = self.get(&fingerprint) {
            tracing::info!(path = %path.display(), %fingerprint, "loaded from cache");
            return Ok(cached);
        }

        let result = process();
        if result.status == ProcessingStatus::Success {
            self.put(&fingerprint, &result);
        }
        Ok(result)
    }

    fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entries.push(path);
            }
        }
        Ok(entries)
    }

    /// Number of cached entries; `0` if the directory cannot be read.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot list cache");
            0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry. Entries that cannot be removed are logged and
    /// skipped; only an unreadable cache directory returns `false`.
    pub fn clear(&self) -> bool {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "cannot list cache");
                return false;
            }
        };

        let mut removed = 0;
        for path in entries {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot remove cache entry");
                }
            }
        }
        tracing::info!(removed, "cleared cache");
        true
    }
}

impl std::fmt::Debug for ProcessingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingCache")
            .field("dir", &self.dir)
            .finish()
    }
}
