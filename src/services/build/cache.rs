//! Layer cache and image tags, persisted as JSON under the project cache dir

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::BuildError;

const CACHE_FILE: &str = "cache.json";

/// Key of a layer: its parent's key, its own instruction and the digest of the
/// files it reads. Chaining through the parent makes any change invalidate
/// every later layer.
pub fn layer_key(parent: Option<&str>, instruction: &str, input_digest: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(instruction.as_bytes());
    hasher.update([0u8]);
    hasher.update(input_digest.unwrap_or("").as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LayerRecord {
    pub instruction: String,
    pub created_at: DateTime<Utc>,
}

/// A tagged, fully built image.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    /// Key of the last layer
    pub id: String,
    pub layers: Vec<String>,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    layers: BTreeMap<String, LayerRecord>,
    #[serde(default)]
    images: BTreeMap<String, ImageRecord>,
}

/// Layer cache, optionally backed by `<dir>/cache.json`.
#[derive(Debug, Default)]
pub struct LayerCache {
    path: Option<PathBuf>,
    state: CacheState,
}

impl LayerCache {
    /// Cache that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache stored in `dir`, or start empty.
    pub fn open(dir: &Path) -> Result<Self, BuildError> {
        let path = dir.join(CACHE_FILE);
        let state = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| BuildError::Cache(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheState::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), layers = state.layers.len(), "Opened layer cache");
        Ok(Self {
            path: Some(path),
            state,
        })
    }

    /// Write the cache back to disk (no-op for in-memory caches).
    pub fn save(&self) -> Result<(), BuildError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| BuildError::Cache(e.to_string()))?;
        // write then rename so an interrupted save never truncates the cache
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.layers.contains_key(key)
    }

    pub fn insert_layer(&mut self, key: &str, instruction: &str) {
        self.state.layers.insert(
            key.to_string(),
            LayerRecord {
                instruction: instruction.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn layer_count(&self) -> usize {
        self.state.layers.len()
    }

    pub fn tag(&mut self, tag: &str, image: ImageRecord) {
        self.state.images.insert(tag.to_string(), image);
    }

    pub fn image(&self, tag: &str) -> Option<&ImageRecord> {
        self.state.images.get(tag)
    }

    /// Drop every layer and tag.
    pub fn clear(&mut self) {
        self.state = CacheState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layer_key_chains_parent() {
        let a = layer_key(None, "FROM python:3.12-slim", None);
        let b = layer_key(Some(&a), "COPY requirements.txt .", Some("abc"));
        assert_eq!(b, layer_key(Some(&a), "COPY requirements.txt .", Some("abc")));
        assert_ne!(b, layer_key(Some(&a), "COPY requirements.txt .", Some("abd")));

        let other_parent = layer_key(None, "FROM python:3.11-slim", None);
        assert_ne!(b, layer_key(Some(&other_parent), "COPY requirements.txt .", Some("abc")));
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join(".webbox");

        let mut cache = LayerCache::open(&cache_dir).unwrap();
        assert_eq!(cache.layer_count(), 0);
        cache.insert_layer("sha256:1", "FROM alpine");
        cache.tag(
            "site:latest",
            ImageRecord {
                id: "sha256:1".to_string(),
                layers: vec!["sha256:1".to_string()],
                built_at: Utc::now(),
            },
        );
        cache.save().unwrap();

        let reopened = LayerCache::open(&cache_dir).unwrap();
        assert!(reopened.contains("sha256:1"));
        assert_eq!(reopened.image("site:latest").map(|i| i.id.as_str()), Some("sha256:1"));
    }

    #[test]
    fn test_corrupt_cache_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CACHE_FILE), "not json").unwrap();
        assert!(matches!(LayerCache::open(dir.path()), Err(BuildError::Cache(_))));
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut cache = LayerCache::in_memory();
        cache.insert_layer("k", "RUN true");
        cache.save().unwrap();
        cache.clear();
        assert!(!cache.contains("k"));
    }
}
