use std::path::Path;
use std::sync::Arc;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::bases::BaseStore;
use crate::cache::BuildCache;
use crate::db::{BaseRecordStore, CacheStore, Database, ImageRecordStore};
use crate::images::ImageStore;
use crate::init_logging_for;
use crate::launch::ContainerRootfs;
use crate::layers::BlobStore;
use crate::metrics::{RuntimeMetrics, RuntimeMetricsStorage};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::RuntimeLock;
use crate::runtime::options::LayerkitOptions;

/// Internal runtime state.
///
/// **Shared via Arc**: This is the actual shared state that can be cloned cheaply.
pub type RuntimeInner = Arc<RuntimeInnerImpl>;

/// Runtime inner implementation.
///
/// Every store synchronizes internally (the database connection sits
/// behind a mutex, blobs are written by rename), so no outer lock is
/// needed. Builds and launches are serialized per home directory by
/// `RuntimeLock` at the process level.
pub struct RuntimeInnerImpl {
    /// Filesystem layout (immutable after init)
    pub(crate) layout: FilesystemLayout,
    pub(crate) blobs: BlobStore,
    pub(crate) cache: BuildCache,
    pub(crate) bases: BaseStore,
    pub(crate) images: ImageStore,
    /// Runtime-wide metrics (AtomicU64 based, lock-free)
    pub(crate) runtime_metrics: RuntimeMetricsStorage,

    /// Runtime filesystem lock (held for lifetime). Prevents multiple
    /// processes from sharing one LAYERKIT_HOME directory.
    pub(crate) _runtime_lock: RuntimeLock,
}

impl RuntimeInnerImpl {
    /// Create a new RuntimeInnerImpl with the provided options.
    ///
    /// Performs all initialization: filesystem setup, lock, database and stores.
    pub fn new(options: LayerkitOptions) -> LayerkitResult<RuntimeInner> {
        if !options.home_dir.is_absolute() {
            return Err(LayerkitError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());

        layout.prepare().map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let runtime_lock = RuntimeLock::acquire(layout.home_dir())?;

        let blobs = BlobStore::new(layout.blobs_dir())?;

        let db = Database::open(&layout.db_path()).map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to initialize database at {}: {}",
                layout.db_path().display(),
                e
            ))
        })?;

        clear_stale_state(&layout);

        let inner = Arc::new(Self {
            cache: BuildCache::new(CacheStore::new(db.clone()), blobs.clone()),
            bases: BaseStore::new(BaseRecordStore::new(db.clone()), blobs.clone(), layout.tmp_dir()),
            images: ImageStore::new(ImageRecordStore::new(db), blobs.clone()),
            blobs,
            layout,
            runtime_metrics: RuntimeMetricsStorage::new(),
            _runtime_lock: runtime_lock,
        });

        tracing::debug!(home = %inner.layout.home_dir().display(), "initialized runtime");
        Ok(inner)
    }

    /// Get runtime-wide metrics.
    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics::new(self.runtime_metrics.clone())
    }
}

/// Remove staging and container leftovers from a previous process that
/// died mid-build or mid-launch (SIGKILL skips `Drop`).
///
/// Safe because the runtime lock guarantees no other process is using them.
/// Containers kept with `--keep-rootfs` carry a marker and survive.
fn clear_stale_state(layout: &FilesystemLayout) {
    sweep_dir(&layout.tmp_dir(), |_| false);
    sweep_dir(&layout.containers_dir(), ContainerRootfs::is_kept);
}

fn sweep_dir(dir: &Path, keep: impl Fn(&Path) -> bool) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if keep(&path) {
            continue;
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale entry"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale entry"),
        }
    }
}
