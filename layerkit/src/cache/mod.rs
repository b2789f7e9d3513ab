//! Build step cache.
//!
//! Every step gets a key chained from its parent's key, so a change in any
//! earlier input invalidates everything after it. Keys for steps that read
//! the build context also cover a digest of the files they copy.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::db::CacheStore;
use crate::layers::{BlobStore, Digest, LayerDescriptor, normalize_mode, safe_join};

/// Incremental step key. Fields are length-prefixed so `("ab", "c")` and
/// `("a", "bc")` never collide.
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    pub fn new(parent: Option<&Digest>, step: &str) -> Self {
        let builder = Self {
            hasher: Sha256::new(),
        };
        builder
            .field("parent", parent.map(Digest::as_str).unwrap_or(""))
            .field("step", step)
    }

    pub fn field(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    pub fn finish(self) -> Digest {
        Digest::from_hasher(self.hasher)
    }
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStep {
    pub step: String,
    pub created_by: String,
    /// `None` for metadata-only steps.
    pub layer: Option<LayerDescriptor>,
}

#[derive(Clone)]
pub struct BuildCache {
    store: CacheStore,
    blobs: BlobStore,
}

impl BuildCache {
    pub fn new(store: CacheStore, blobs: BlobStore) -> Self {
        Self { store, blobs }
    }

    /// A hit only counts if its layer blob is still in the store.
    pub fn lookup(&self, key: &Digest) -> LayerkitResult<Option<CachedStep>> {
        let Some(step) = self.store.get(key.as_str())? else {
            return Ok(None);
        };
        let blob_missing = step
            .layer
            .as_ref()
            .is_some_and(|layer| !self.blobs.contains(&layer.digest));
        if blob_missing {
            tracing::warn!(
                key = %key.short(),
                step = %step.step,
                "Cached layer blob missing, dropping cache entry"
            );
            self.store.remove(key.as_str())?;
            return Ok(None);
        }
        Ok(Some(step))
    }

    pub fn record(&self, key: &Digest, step: &CachedStep) -> LayerkitResult<()> {
        self.store.put(key.as_str(), step)
    }

    pub fn len(&self) -> LayerkitResult<u64> {
        self.store.count()
    }
}

/// Digest of the context files named by `sources`: relative paths, kinds,
/// normalized modes and contents, in source order then path order.
pub fn digest_sources(context: &Path, sources: &[String]) -> LayerkitResult<Digest> {
    let mut hasher = Sha256::new();
    for source in sources {
        let root = safe_join(context, Path::new(source)).ok_or_else(|| {
            LayerkitError::Path(format!("source '{}' escapes the build context", source))
        })?;
        if std::fs::symlink_metadata(&root).is_err() {
            return Err(LayerkitError::Path(format!(
                "source '{}' not found in build context {}",
                source,
                context.display()
            )));
        }

        hasher.update((source.len() as u64).to_le_bytes());
        hasher.update(source.as_bytes());
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                LayerkitError::Path(format!("cannot read source '{}': {}", source, e))
            })?;
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let rel = rel.to_string_lossy();
            hasher.update((rel.len() as u64).to_le_bytes());
            hasher.update(rel.as_bytes());

            let file_type = entry.file_type();
            if file_type.is_dir() {
                hasher.update(b"d");
            } else if file_type.is_symlink() {
                hasher.update(b"l");
                hasher.update(std::fs::read_link(entry.path())?.to_string_lossy().as_bytes());
            } else if file_type.is_file() {
                let mode = normalize_mode(entry.path().metadata()?.permissions().mode());
                hasher.update(b"f");
                hasher.update(mode.to_le_bytes());
                hasher.update(Digest::of_file(entry.path())?.as_str().as_bytes());
            }
        }
    }
    Ok(Digest::from_hasher(hasher))
}
