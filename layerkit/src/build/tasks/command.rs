//! Task: record the default command. Metadata only, no layer.

use super::{BuildCtx, StepInput, finish_step, log_task_error, task_start};
use crate::cache::{CachedStep, KeyBuilder};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use async_trait::async_trait;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::time::Instant;

pub struct CommandTask;

#[async_trait]
impl PipelineTask<BuildCtx> for CommandTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let result = async {
            let key = KeyBuilder::new(input.parent_key.as_ref(), task_name)
                .field("cmd", serde_json::to_vec(&input.recipe.command)?)
                .finish();
            let [.., created_by] = input.recipe.step_lines();
            let (step, status) = input
                .cached_or(&key, || async move {
                    Ok(CachedStep {
                        step: task_name.to_string(),
                        created_by,
                        layer: None,
                    })
                })
                .await?;
            Ok::<_, LayerkitError>((key, step, status))
        }
        .await;
        let (key, step, status) =
            result.inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "command"
    }
}
