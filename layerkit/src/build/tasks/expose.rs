//! Task: record the exposed ports. Metadata only, no layer.

use super::{BuildCtx, StepInput, finish_step, log_task_error, task_start};
use crate::cache::{CachedStep, KeyBuilder};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use async_trait::async_trait;
use layerkit_shared::errors::LayerkitResult;
use std::time::Instant;

pub struct ExposeTask;

#[async_trait]
impl PipelineTask<BuildCtx> for ExposeTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let ports: Vec<String> = input.recipe.expose.iter().map(ToString::to_string).collect();
        let key = KeyBuilder::new(input.parent_key.as_ref(), task_name)
            .field("ports", ports.join(" "))
            .finish();
        let [.., created_by, _] = input.recipe.step_lines();

        let (step, status) = input
            .cached_or(&key, || async move {
                Ok(CachedStep {
                    step: task_name.to_string(),
                    created_by,
                    layer: None,
                })
            })
            .await
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "expose"
    }
}
