//! Task: resolve the `FROM` reference against the base store.
//!
//! Resolution runs on every build, cached or not, so an unpinned or
//! missing base always fails with `ResolutionError`.

use super::{BuildCtx, StepInput, finish_step, log_task_error, task_start};
use crate::cache::{CachedStep, KeyBuilder};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use async_trait::async_trait;
use layerkit_shared::errors::LayerkitResult;
use std::time::Instant;

pub struct ResolveBaseTask;

#[async_trait]
impl PipelineTask<BuildCtx> for ResolveBaseTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let reference = &input.recipe.base;
        let base = input
            .runtime
            .bases
            .resolve(reference)
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        let key = KeyBuilder::new(None, task_name)
            .field("reference", reference.to_string())
            .field("layer", base.layer.digest.as_str())
            .finish();
        let [created_by, ..] = input.recipe.step_lines();
        let layer = base.layer.clone();

        let (step, status) = input
            .cached_or(&key, || async move {
                Ok(CachedStep {
                    step: task_name.to_string(),
                    created_by,
                    layer: Some(layer),
                })
            })
            .await?;

        ctx.lock().await.base = Some(base);
        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "resolve_base"
    }
}
