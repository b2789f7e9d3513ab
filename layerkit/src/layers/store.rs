//! Content-addressed blob store.
//!
//! Blobs live at `<root>/<hex>` under their sha256 digest. Writes go
//! through a temporary file in the same directory followed by a rename, so
//! a blob path either holds complete content or does not exist.

use super::archive::{LayerDescriptor, PendingLayer};
use super::digest::Digest;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> LayerkitResult<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to create blob store at {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.hex())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    /// Move a finished layer into the store.
    pub fn commit_layer(&self, pending: PendingLayer) -> LayerkitResult<LayerDescriptor> {
        let PendingLayer { file, descriptor } = pending;
        let target = self.path(&descriptor.digest);

        if target.is_file() {
            tracing::debug!(digest = %descriptor.digest.short(), "Layer already stored");
            return Ok(descriptor);
        }

        file.persist(&target).map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to store layer {}: {}",
                descriptor.digest, e.error
            ))
        })?;
        tracing::debug!(
            digest = %descriptor.digest.short(),
            size = descriptor.size,
            "Stored layer"
        );
        Ok(descriptor)
    }

    /// Store raw bytes (image configs and manifests) and return their digest.
    pub fn put_bytes(&self, bytes: &[u8]) -> LayerkitResult<Digest> {
        let digest = Digest::of_bytes(bytes);
        let target = self.path(&digest);
        if target.is_file() {
            return Ok(digest);
        }

        let mut file = NamedTempFile::new_in(&self.root)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.persist(&target).map_err(|e| {
            LayerkitError::Storage(format!("Failed to store blob {}: {}", digest, e.error))
        })?;
        Ok(digest)
    }

    pub fn read(&self, digest: &Digest) -> LayerkitResult<Vec<u8>> {
        let path = self.path(digest);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LayerkitError::NotFound(format!("blob {}", digest)),
            _ => LayerkitError::Storage(format!("Failed to read blob {}: {}", digest, e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerWriter;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_read_bytes() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();

        let digest = store.put_bytes(b"{}").unwrap();
        assert!(store.contains(&digest));
        assert_eq!(store.read(&digest).unwrap(), b"{}");
        assert_eq!(store.put_bytes(b"{}").unwrap(), digest);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();
        let err = store.read(&Digest::of_bytes(b"nope")).unwrap_err();
        assert!(matches!(err, LayerkitError::NotFound(_)));
    }

    #[test]
    fn test_commit_layer_addresses_by_digest() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("blobs")).unwrap();

        let mut writer = LayerWriter::create(dir.path()).unwrap();
        writer.add_dir(Path::new("app")).unwrap();
        let layer = store.commit_layer(writer.finish().unwrap()).unwrap();

        let on_disk = Digest::of_file(&store.path(&layer.digest)).unwrap();
        assert_eq!(on_disk, layer.digest);
        assert_eq!(
            std::fs::metadata(store.path(&layer.digest)).unwrap().len(),
            layer.size
        );
    }
}
