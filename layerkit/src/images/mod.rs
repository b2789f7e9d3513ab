//! Image store: manifests and configs in the blob store, tags in SQLite.

mod config;

pub use config::{
    ContainerConfig, Descriptor, EmptyObject, History, ImageConfig, ImageManifest, RootFs,
    host_architecture,
};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::db::ImageRecordStore;
use crate::layers::{BlobStore, Digest, LayerDescriptor};

/// Tag row for a committed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    pub created_at: DateTime<Utc>,
}

/// Name and manifest digest of a committed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub digest: Digest,
}

/// A fully loaded image.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub record: ImageRecord,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

impl Image {
    pub fn working_dir(&self) -> &PathBuf {
        &self.config.config.working_dir
    }

    pub fn command(&self) -> &[String] {
        &self.config.config.cmd
    }

    pub fn layer_digests(&self) -> impl Iterator<Item = &Digest> {
        self.manifest.layers.iter().map(|d| &d.digest)
    }
}

/// Image names are `name[:tag]` with lowercase path components.
pub fn validate_name(name: &str) -> LayerkitResult<()> {
    let (repo, tag) = match name.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (name, None),
    };
    let repo_ok = !repo.is_empty()
        && repo.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        });
    let tag_ok = tag.is_none_or(|t| {
        !t.is_empty()
            && t.len() <= 128
            && t.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    });
    if repo_ok && tag_ok {
        Ok(())
    } else {
        Err(LayerkitError::Config(format!("invalid image name '{}'", name)))
    }
}

#[derive(Clone)]
pub struct ImageStore {
    records: ImageRecordStore,
    blobs: BlobStore,
}

impl ImageStore {
    pub fn new(records: ImageRecordStore, blobs: BlobStore) -> Self {
        Self { records, blobs }
    }

    /// Write config and manifest blobs and point `name` at the manifest.
    pub fn commit(
        &self,
        name: &str,
        config: &ImageConfig,
        layers: &[LayerDescriptor],
    ) -> LayerkitResult<ImageRef> {
        validate_name(name)?;
        for layer in layers {
            if !self.blobs.contains(&layer.digest) {
                return Err(LayerkitError::Storage(format!(
                    "layer {} missing from blob store",
                    layer.digest
                )));
            }
        }

        let config_bytes = serde_json::to_vec(config)?;
        let config_digest = self.blobs.put_bytes(&config_bytes)?;
        let manifest = ImageManifest::new(
            Descriptor {
                media_type: MediaType::ImageConfig,
                digest: config_digest.clone(),
                size: config_bytes.len() as u64,
            },
            layers,
        );
        let manifest_digest = self.blobs.put_bytes(&serde_json::to_vec(&manifest)?)?;

        self.records.put(&ImageRecord {
            name: name.to_string(),
            manifest_digest: manifest_digest.clone(),
            config_digest,
            created_at: Utc::now(),
        })?;

        tracing::info!(
            image = %name,
            digest = %manifest_digest.short(),
            layers = layers.len(),
            "Committed image"
        );
        Ok(ImageRef {
            name: name.to_string(),
            digest: manifest_digest,
        })
    }

    pub fn get(&self, name: &str) -> LayerkitResult<Image> {
        let record = self
            .records
            .get(name)?
            .ok_or_else(|| LayerkitError::NotFound(format!("image '{}'", name)))?;
        let manifest: ImageManifest =
            serde_json::from_slice(&self.blobs.read(&record.manifest_digest)?)?;
        let config: ImageConfig = serde_json::from_slice(&self.blobs.read(&manifest.config.digest)?)?;
        Ok(Image {
            record,
            manifest,
            config,
        })
    }

    pub fn exists(&self, name: &str) -> LayerkitResult<bool> {
        Ok(self.records.get(name)?.is_some())
    }

    pub fn list(&self) -> LayerkitResult<Vec<ImageRecord>> {
        self.records.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::layers::LayerWriter;
    use crate::recipe::ExposedPort;
    use std::path::Path;
    use tempfile::TempDir;

    fn store(home: &Path) -> (ImageStore, BlobStore) {
        let db = Database::open(&home.join("db/layerkit.db")).unwrap();
        let blobs = BlobStore::new(home.join("blobs/sha256")).unwrap();
        (ImageStore::new(ImageRecordStore::new(db), blobs.clone()), blobs)
    }

    fn layer(home: &Path, blobs: &BlobStore) -> LayerDescriptor {
        let mut writer = LayerWriter::create(home).unwrap();
        writer.add_dir(Path::new("app")).unwrap();
        blobs.commit_layer(writer.finish().unwrap()).unwrap()
    }

    fn config(layers: &[LayerDescriptor]) -> ImageConfig {
        ImageConfig::new(
            PathBuf::from("/app"),
            &[ExposedPort::tcp(8000)],
            vec!["uvicorn".into(), "main:app".into()],
            layers,
            vec![],
        )
    }

    #[test]
    fn test_commit_get_list() {
        let home = TempDir::new().unwrap();
        let (images, blobs) = store(home.path());
        let layers = vec![layer(home.path(), &blobs)];

        let image_ref = images.commit("api:latest", &config(&layers), &layers).unwrap();
        let image = images.get("api:latest").unwrap();
        assert_eq!(image.record.manifest_digest, image_ref.digest);
        assert_eq!(image.working_dir(), &PathBuf::from("/app"));
        assert_eq!(image.layer_digests().collect::<Vec<_>>(), vec![&layers[0].digest]);
        assert_eq!(images.list().unwrap().len(), 1);
    }

    #[test]
    fn test_same_inputs_same_digest() {
        let home = TempDir::new().unwrap();
        let (images, blobs) = store(home.path());
        let layers = vec![layer(home.path(), &blobs)];

        let first = images.commit("api:v1", &config(&layers), &layers).unwrap();
        let second = images.commit("api:v2", &config(&layers), &layers).unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn test_missing_image_is_not_found() {
        let home = TempDir::new().unwrap();
        let (images, _) = store(home.path());
        assert!(matches!(images.get("nope"), Err(LayerkitError::NotFound(_))));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("api").is_ok());
        assert!(validate_name("team/api:1.0").is_ok());
        assert!(validate_name("API").is_err());
        assert!(validate_name("api:").is_err());
        assert!(validate_name("").is_err());
    }
}
