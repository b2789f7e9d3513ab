//! Build tasks, one per recipe step.
//!
//! Every task follows the same shape: derive the step key from the parent
//! key and the step's inputs, reuse the cached result when there is one,
//! otherwise do the work, then hand the outcome to [`finish_step`].

mod command;
mod copy_manifest;
mod copy_source;
mod expose;
mod install;
mod resolve_base;
mod workdir;

pub use command::CommandTask;
pub use copy_manifest::CopyManifestTask;
pub use copy_source::CopySourceTask;
pub use expose::ExposeTask;
pub use install::InstallTask;
pub use resolve_base::ResolveBaseTask;
pub use workdir::WorkdirTask;
pub(crate) use workdir::normalize_workdir;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::sync::Mutex;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use super::types::{BuildPipelineContext, StepReport, StepStatus};
use crate::cache::CachedStep;
use crate::images::History;
use crate::layers::{Digest, LayerDescriptor};
use crate::pipeline::{StepIndex, TaskOutcome};
use crate::recipe::Recipe;
use crate::runtime::RuntimeInner;

pub type BuildCtx = Arc<Mutex<BuildPipelineContext>>;

/// Log task start and return the build id for error logging.
async fn task_start(ctx: &BuildCtx, task_name: &str, index: StepIndex) -> String {
    let ctx = ctx.lock().await;
    tracing::debug!(build_id = %ctx.build_id, task = task_name, step = %index, "Build task starting");
    ctx.build_id.clone()
}

fn log_task_error(build_id: &str, task_name: &str, err: &LayerkitError) {
    tracing::error!(
        build_id = %build_id,
        task = task_name,
        kind = err.kind(),
        error = %err,
        "Build task failed"
    );
}

/// Inputs copied out of the context so no lock is held while a step works.
struct StepInput {
    runtime: RuntimeInner,
    recipe: Recipe,
    context_dir: PathBuf,
    parent_key: Option<Digest>,
    layers: Vec<LayerDescriptor>,
    no_cache: bool,
}

impl StepInput {
    async fn capture(ctx: &BuildCtx) -> Self {
        let ctx = ctx.lock().await;
        Self {
            runtime: ctx.runtime.clone(),
            recipe: ctx.recipe.clone(),
            context_dir: ctx.context_dir.clone(),
            parent_key: ctx.parent_key.clone(),
            layers: ctx.layers.clone(),
            no_cache: ctx.no_cache,
        }
    }

    /// Blob paths of the layers below the current step, bottom-up.
    fn layer_paths(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .map(|layer| self.runtime.blobs.path(&layer.digest))
            .collect()
    }

    /// Return the cached outcome for `key`, or run `execute`.
    async fn cached_or<F, Fut>(
        &self,
        key: &Digest,
        execute: F,
    ) -> LayerkitResult<(CachedStep, StepStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LayerkitResult<CachedStep>>,
    {
        if !self.no_cache {
            if let Some(hit) = self.runtime.cache.lookup(key)? {
                return Ok((hit, StepStatus::Cached));
            }
        }
        Ok((execute().await?, StepStatus::Executed))
    }
}

/// Record a finished step in the context and (when executed) the cache.
async fn finish_step(
    ctx: &BuildCtx,
    key: Digest,
    step: CachedStep,
    status: StepStatus,
    started: Instant,
) -> LayerkitResult<TaskOutcome> {
    let mut ctx = ctx.lock().await;
    let metrics = &ctx.runtime.runtime_metrics;
    match status {
        StepStatus::Executed => {
            ctx.runtime.cache.record(&key, &step)?;
            metrics.steps_executed.fetch_add(1, Ordering::Relaxed);
        }
        StepStatus::Cached => {
            metrics.steps_cached.fetch_add(1, Ordering::Relaxed);
        }
    }

    let duration_ms = started.elapsed().as_millis();
    tracing::info!(
        build_id = %ctx.build_id,
        step = %step.step,
        status = ?status,
        layer = step.layer.as_ref().map(|l| l.digest.short()).unwrap_or("-"),
        duration_ms,
        "{}",
        step.created_by
    );

    if let Some(layer) = &step.layer {
        ctx.layers.push(layer.clone());
    }
    ctx.history.push(History {
        created_by: step.created_by.clone(),
        empty_layer: step.layer.is_none(),
    });
    ctx.steps.push(StepReport {
        name: step.step,
        created_by: step.created_by,
        status,
        layer: step.layer.map(|l| l.digest),
        duration_ms,
    });
    ctx.parent_key = Some(key.clone());
    Ok(TaskOutcome::keyed(key, status == StepStatus::Cached))
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> LayerkitResult<T>
where
    F: FnOnce() -> LayerkitResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LayerkitError::Internal(format!("blocking task failed: {}", e)))?
}

/// An absolute in-image path as a path relative to the image root.
fn image_rel(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}
