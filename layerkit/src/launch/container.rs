//! Ephemeral container root filesystems.

use std::path::{Path, PathBuf};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use ulid::Ulid;

use crate::layers::{extract_layers, safe_join};

/// Container id: a ULID (26 chars, sortable by creation time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Root filesystem of one container, removed on drop unless kept.
#[derive(Debug)]
pub struct ContainerRootfs {
    id: ContainerId,
    path: PathBuf,
    keep: bool,
}

impl ContainerRootfs {
    /// Materialize `layers` (bottom-up blob paths) under `containers_dir/<id>`.
    pub fn create(containers_dir: &Path, layers: &[PathBuf], keep: bool) -> LayerkitResult<Self> {
        let id = ContainerId::new();
        let path = containers_dir.join(id.as_str());
        // Construct first so a failed extraction still cleans up.
        let rootfs = Self { id, path, keep };
        extract_layers(layers.iter().map(PathBuf::as_path), &rootfs.path).map_err(|e| {
            LayerkitError::Launch(format!(
                "Failed to materialize container {}: {}",
                rootfs.id.short(),
                e
            ))
        })?;
        tracing::debug!(
            container_id = %rootfs.id.short(),
            layers = layers.len(),
            path = %rootfs.path.display(),
            "Materialized container rootfs"
        );
        Ok(rootfs)
    }

    /// Marker written next to a kept rootfs so startup sweeps skip it.
    fn keep_marker(path: &Path) -> PathBuf {
        path.with_extension("keep")
    }

    /// Whether `path` (a rootfs dir or its marker) belongs to a kept container.
    pub fn is_kept(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "keep") || Self::keep_marker(path).exists()
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host path of an absolute in-image path.
    pub fn host_path(&self, in_image: &Path) -> LayerkitResult<PathBuf> {
        let rel = in_image.strip_prefix("/").unwrap_or(in_image);
        safe_join(&self.path, rel).ok_or_else(|| {
            LayerkitError::Path(format!("{} escapes the container root", in_image.display()))
        })
    }
}

impl Drop for ContainerRootfs {
    fn drop(&mut self) {
        if self.keep {
            if let Err(e) = std::fs::write(Self::keep_marker(&self.path), self.id.as_str()) {
                tracing::warn!(container_id = %self.id.short(), error = %e, "Failed to mark kept rootfs");
            }
            tracing::info!(
                container_id = %self.id,
                path = %self.path.display(),
                "Keeping container rootfs"
            );
            return;
        }
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    container_id = %self.id.short(),
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove container rootfs"
                );
            }
        }
    }
}
