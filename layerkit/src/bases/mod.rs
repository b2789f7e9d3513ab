//! Local store of base environments.
//!
//! A base environment is a directory tree imported once as a single
//! deterministic layer and registered under a pinned reference. Builds
//! resolve `FROM` against this store only.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::db::BaseRecordStore;
use crate::layers::{BlobStore, LayerDescriptor, LayerWriter};
use crate::recipe::{BasePin, BaseRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub reference: BaseRef,
    pub layer: LayerDescriptor,
    /// Directory the base was imported from.
    pub source: PathBuf,
    pub imported_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BaseStore {
    records: BaseRecordStore,
    blobs: BlobStore,
    tmp_dir: PathBuf,
}

impl BaseStore {
    pub fn new(records: BaseRecordStore, blobs: BlobStore, tmp_dir: PathBuf) -> Self {
        Self {
            records,
            blobs,
            tmp_dir,
        }
    }

    /// Import `dir` as the base environment `reference`.
    ///
    /// A digest reference must match the digest of the resulting layer.
    pub fn import(&self, reference: &BaseRef, dir: &Path) -> LayerkitResult<BaseRecord> {
        reference.ensure_pinned()?;
        if !dir.is_dir() {
            return Err(LayerkitError::Path(format!(
                "base environment source {} is not a directory",
                dir.display()
            )));
        }

        let mut writer = LayerWriter::create(&self.tmp_dir)?;
        writer.add_tree(dir, Path::new(""))?;
        let pending = writer.finish()?;

        if let BasePin::Digest(expected) = &reference.pin {
            if *expected != pending.descriptor.digest {
                return Err(LayerkitError::Resolution(format!(
                    "{} does not match imported content {}",
                    reference, pending.descriptor.digest
                )));
            }
        }

        let layer = self.blobs.commit_layer(pending)?;
        let record = BaseRecord {
            reference: reference.clone(),
            layer,
            source: dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()),
            imported_at: Utc::now(),
        };
        self.records.put(&record)?;

        tracing::info!(
            reference = %record.reference,
            digest = %record.layer.digest.short(),
            size = record.layer.size,
            "Imported base environment"
        );
        Ok(record)
    }

    /// Resolve a recipe's `FROM` reference to an imported base.
    pub fn resolve(&self, reference: &BaseRef) -> LayerkitResult<BaseRecord> {
        reference.ensure_pinned()?;

        let found = match &reference.pin {
            BasePin::Digest(digest) => self
                .records
                .find_by_layer(&reference.name, digest.as_str())?,
            _ => self.records.get(&reference.to_string())?,
        };
        let record = found.ok_or_else(|| {
            LayerkitError::Resolution(format!(
                "base environment '{}' is not available locally; import it with `layerkit base import {} <DIR>`",
                reference, reference
            ))
        })?;

        if !self.blobs.contains(&record.layer.digest) {
            return Err(LayerkitError::Resolution(format!(
                "base environment '{}' is registered but its layer {} is missing",
                reference, record.layer.digest
            )));
        }
        Ok(record)
    }

    pub fn list(&self) -> LayerkitResult<Vec<BaseRecord>> {
        self.records.list()
    }
}
