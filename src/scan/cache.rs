use crate::{error::*, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Manifest digest of a tag as of its registry timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub updated: DateTime<Utc>,
    pub hash: Digest,
}

/// Persistent map from tag name to its last known manifest digest
///
/// ```json
/// { "r17_0_1": { "updated": "2021-05-01T12:00:00Z", "hash": "sha256:..." } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl ManifestCache {
    /// Load a cache file. A missing, unreadable or corrupt file gives an
    /// empty cache.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(cache)) => {
                log::debug!(
                    "Loaded {} cached digests from {}",
                    cache.len(),
                    path.display()
                );
                cache
            }
            Ok(None) => {
                log::debug!("No cache file at {}", path.display());
                Self::default()
            }
            Err(e) => {
                log::warn!("{}", e);
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Option<Self>> {
        let load_err = |reason: String| Error::CacheLoad {
            path: path.to_owned(),
            reason,
        };
        let input = match fs::read_to_string(path) {
            Ok(input) => input,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(load_err(e.to_string())),
        };
        let cache = serde_json::from_str(&input).map_err(|e| load_err(e.to_string()))?;
        Ok(Some(cache))
    }

    /// Write the cache, creating its parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |reason: String| Error::CacheWrite {
            path: path.to_owned(),
            reason,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let output = serde_json::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        fs::write(path, output).map_err(|e| write_err(e.to_string()))?;
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&CacheEntry> {
        self.entries.get(tag)
    }

    /// Cached digest of `tag`, unless the registry reports a newer update
    pub fn fresh(&self, tag: &str, last_updated: DateTime<Utc>) -> Option<&Digest> {
        self.entries
            .get(tag)
            .filter(|entry| entry.updated >= last_updated)
            .map(|entry| &entry.hash)
    }

    pub fn insert(&mut self, tag: &str, updated: DateTime<Utc>, hash: Digest) {
        self.entries
            .insert(tag.to_string(), CacheEntry { updated, hash });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a scanner keeps its cache, if anywhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheStore {
    pub path: Option<PathBuf>,
    pub cache: ManifestCache,
}

impl CacheStore {
    pub fn open(path: Option<PathBuf>) -> Self {
        let cache = path
            .as_deref()
            .map(ManifestCache::load)
            .unwrap_or_default();
        CacheStore { path, cache }
    }

    /// Best-effort rewrite of the cache file
    pub fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = self.cache.save(path) {
                log::error!("{}", e);
            }
        }
    }
}
