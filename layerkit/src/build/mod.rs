//! Image build orchestration.
//!
//! ## Architecture
//!
//! A build is a table-driven pipeline with one task per recipe step:
//!
//! ```text
//!   1. base          ResolveBase  (FROM: look up the pinned base layer)
//!                    Workdir      (WORKDIR: create the directory)
//!   2. dependencies  CopyManifest (COPY manifest only)
//!                    Install      (RUN: install dependencies)
//!   3. source        CopySource   (COPY the application tree)
//!   4. metadata      Expose       (EXPOSE: ports, no layer)
//!                    Command      (CMD: default command, no layer)
//! ```
//!
//! Each step key hashes the previous step's key with the step's own
//! inputs, so a change invalidates that step and everything after it
//! while the steps before it stay cached.
//!
//! `BuildGuard` accounts for failed builds. No image record is written
//! unless every step succeeds.

mod tasks;
mod types;

pub use types::{BuildReport, StepReport, StepStatus};

use crate::images::ImageConfig;
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::recipe::Recipe;
use crate::runtime::{BuildOptions, RuntimeInner};
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use tasks::{
    BuildCtx, CommandTask, CopyManifestTask, CopySourceTask, ExposeTask, InstallTask,
    ResolveBaseTask, WorkdirTask,
};
use types::BuildPipelineContext;

// ============================================================================
// EXECUTION PLAN
// ============================================================================

fn get_execution_plan() -> ExecutionPlan<BuildCtx> {
    let stages: Vec<Stage<BoxedTask<BuildCtx>>> = vec![
        Stage::new(
            "base",
            vec![Box::new(ResolveBaseTask), Box::new(WorkdirTask)],
        ),
        // Manifest copy and install come before the source tree so that
        // source edits never invalidate the install layer.
        Stage::new(
            "dependencies",
            vec![Box::new(CopyManifestTask), Box::new(InstallTask)],
        ),
        Stage::new("source", vec![Box::new(CopySourceTask)]),
        Stage::new("metadata", vec![Box::new(ExposeTask), Box::new(CommandTask)]),
    ];

    ExecutionPlan::new(stages)
}

fn log_stage_durations(build_id: &str, metrics: &PipelineMetrics) {
    for stage in &metrics.stages {
        tracing::debug!(
            build_id,
            stage = stage.name,
            duration_ms = stage.duration_ms,
            tasks = ?stage.tasks.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Build stage finished"
        );
    }
    tracing::debug!(
        build_id,
        cached = ?metrics.cached_tasks(),
        total_ms = metrics.total_duration_ms,
        "Build pipeline finished"
    );
}

/// Builds an image from a parsed recipe.
///
/// # Example
///
/// ```ignore
/// let report = ImageBuilder::new(runtime, recipe, options)?
///     .build()
///     .await?;
/// ```
pub(crate) struct ImageBuilder {
    runtime: RuntimeInner,
    recipe: Recipe,
    context_dir: PathBuf,
    image_name: String,
    no_cache: bool,
}

impl ImageBuilder {
    pub(crate) fn new(
        runtime: RuntimeInner,
        recipe: Recipe,
        options: BuildOptions,
    ) -> LayerkitResult<Self> {
        options.sanitize()?;
        let context_dir = options.context.canonicalize().map_err(|e| {
            LayerkitError::Path(format!(
                "cannot resolve build context {}: {}",
                options.context.display(),
                e
            ))
        })?;

        Ok(Self {
            runtime,
            recipe,
            context_dir,
            image_name: options.image_name(),
            no_cache: options.no_cache,
        })
    }

    /// Run every step and commit the image.
    pub(crate) async fn build(self) -> LayerkitResult<BuildReport> {
        let total_start = Instant::now();

        let ImageBuilder {
            runtime,
            recipe,
            context_dir,
            image_name,
            no_cache,
        } = self;

        let build_id = ulid::Ulid::new().to_string().to_lowercase();
        tracing::info!(
            build_id = %build_id,
            image = %image_name,
            context = %context_dir.display(),
            no_cache,
            "Building image"
        );

        let ctx = BuildPipelineContext::new(
            runtime,
            recipe,
            context_dir,
            image_name,
            no_cache,
            build_id.clone(),
        );
        let ctx = Arc::new(Mutex::new(ctx));

        let pipeline = PipelineBuilder::from_plan(get_execution_plan());
        let pipeline_metrics = PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await?;
        log_stage_durations(&build_id, &pipeline_metrics);

        let mut ctx = ctx.lock().await;
        let workdir = tasks::normalize_workdir(&ctx.recipe.workdir)?;
        let config = ImageConfig::new(
            workdir,
            &ctx.recipe.expose,
            ctx.recipe.command.clone(),
            &ctx.layers,
            ctx.history.clone(),
        );
        let image = ctx.runtime.images.commit(&ctx.image_name, &config, &ctx.layers)?;

        ctx.guard.disarm();

        let report = BuildReport {
            image,
            steps: std::mem::take(&mut ctx.steps),
            total_duration_ms: total_start.elapsed().as_millis(),
        };
        tracing::info!(
            build_id = %build_id,
            image = %report.image.name,
            digest = %report.image.digest.short(),
            executed = ?report.executed(),
            duration_ms = report.total_duration_ms,
            "Image built"
        );
        Ok(report)
    }
}
