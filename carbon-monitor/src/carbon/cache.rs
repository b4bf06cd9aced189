use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarbonCacheEntry {
    pub value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

impl CarbonCacheEntry {
    pub fn is_fresh(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Location key -> last fetched intensity, mirrored to a JSON file.
///
/// One entry per key; a refresh overwrites it.
#[derive(Debug, Clone)]
pub struct CarbonCache {
    path: PathBuf,
    entries: BTreeMap<String, CarbonCacheEntry>,
}

impl CarbonCache {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Read the cache file. A missing or unreadable file starts an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "ignoring unreadable carbon cache file");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read carbon cache file");
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&CarbonCacheEntry> {
        self.entries.get(key)
    }

    /// The entry for `key` if it is younger than `ttl`.
    pub fn fresh(&self, key: &str, now: OffsetDateTime, ttl: Duration) -> Option<CarbonCacheEntry> {
        self.entries.get(key).filter(|e| e.is_fresh(now, ttl)).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<f64>, fetched_at: OffsetDateTime) {
        self.entries.insert(key.into(), CarbonCacheEntry { value, fetched_at });
    }

    /// Rewrite the whole file via a sibling temp file and rename.
    pub fn save(&self) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(io::Error::other)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)
    }

    pub fn clear(&mut self) -> io::Result<()> {
        self.entries.clear();
        self.save()
    }
}
