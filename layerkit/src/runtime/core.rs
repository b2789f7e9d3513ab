//! High-level runtime API.

use std::path::Path;
use std::sync::atomic::Ordering;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::bases::BaseRecord;
use crate::build::{BuildReport, ImageBuilder};
use crate::images::{Image, ImageRecord};
use crate::launch::{self, LaunchOutcome};
use crate::metrics::RuntimeMetrics;
use crate::recipe::{BaseRef, Recipe};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{BuildOptions, LaunchOptions, LayerkitOptions};
use crate::runtime::rt_impl::{RuntimeInner, RuntimeInnerImpl};

/// LayerkitRuntime is the main entry point for building and launching images.
///
/// **Lock Behavior**: Only one `LayerkitRuntime` can use a given
/// `LAYERKIT_HOME` directory at a time. The filesystem lock is released
/// when the last clone is dropped.
///
/// **Cloning**: Runtime is cheaply cloneable via `Arc` - all clones share the same state.
#[derive(Clone)]
pub struct LayerkitRuntime {
    inner: RuntimeInner,
}

impl LayerkitRuntime {
    /// Create a new LayerkitRuntime with the provided options.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Another runtime is already using the same home directory
    /// - Filesystem or database initialization fails
    pub fn new(options: LayerkitOptions) -> LayerkitResult<Self> {
        Ok(Self {
            inner: RuntimeInnerImpl::new(options)?,
        })
    }

    /// Create a runtime using `LayerkitOptions::default()`.
    pub fn with_defaults() -> LayerkitResult<Self> {
        Self::new(LayerkitOptions::default())
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    // ========================================================================
    // BUILD
    // ========================================================================

    /// Build the recipe found in `options` and tag the result.
    pub async fn build(&self, options: BuildOptions) -> LayerkitResult<BuildReport> {
        options.sanitize()?;
        let recipe = Recipe::from_file(&options.recipe_path())?;
        self.build_recipe(recipe, options).await
    }

    /// Build an already parsed recipe against `options.context`.
    pub async fn build_recipe(
        &self,
        recipe: Recipe,
        options: BuildOptions,
    ) -> LayerkitResult<BuildReport> {
        self.inner
            .runtime_metrics
            .builds_total
            .fetch_add(1, Ordering::Relaxed);
        if let Err(e) = recipe.validate() {
            tracing::error!(kind = e.kind(), error = %e, "Recipe rejected");
            self.inner
                .runtime_metrics
                .builds_failed
                .fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        ImageBuilder::new(self.inner.clone(), recipe, options)?
            .build()
            .await
    }

    // ========================================================================
    // LAUNCH
    // ========================================================================

    /// Start the image's process in the foreground and wait for it to exit.
    pub async fn launch(&self, image: &str, options: LaunchOptions) -> LayerkitResult<LaunchOutcome> {
        self.inner
            .runtime_metrics
            .launches_total
            .fetch_add(1, Ordering::Relaxed);

        let result = async {
            let image = self.inner.images.get(image)?;
            launch::launch(&self.inner, image, &options).await
        }
        .await;

        if let Err(e) = &result {
            tracing::error!(image, kind = e.kind(), error = %e, "Launch failed");
            self.inner
                .runtime_metrics
                .launches_failed
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    // ========================================================================
    // IMAGES
    // ========================================================================

    pub fn images(&self) -> LayerkitResult<Vec<ImageRecord>> {
        self.inner.images.list()
    }

    pub fn inspect(&self, image: &str) -> LayerkitResult<Image> {
        self.inner.images.get(image)
    }

    // ========================================================================
    // BASE ENVIRONMENTS
    // ========================================================================

    /// Import the directory `dir` as base environment `reference`.
    pub async fn import_base(&self, reference: &str, dir: &Path) -> LayerkitResult<BaseRecord> {
        let reference = BaseRef::parse(reference)?;
        let bases = self.inner.bases.clone();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || bases.import(&reference, &dir))
            .await
            .map_err(|e| LayerkitError::Internal(format!("import task panicked: {}", e)))?
    }

    pub fn bases(&self) -> LayerkitResult<Vec<BaseRecord>> {
        self.inner.bases.list()
    }

    /// Get runtime-wide metrics.
    pub fn metrics(&self) -> RuntimeMetrics {
        self.inner.metrics()
    }
}

impl std::fmt::Debug for LayerkitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerkitRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}
