//! Task: copy only the dependency manifest.
//!
//! Keeping this copy separate from the source tree is what lets the
//! install step stay cached across source-only edits.

use super::copy_source::{resolve_source, run_copy};
use super::{BuildCtx, StepInput, finish_step, log_task_error, task_start};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use async_trait::async_trait;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::time::Instant;

pub struct CopyManifestTask;

#[async_trait]
impl PipelineTask<BuildCtx> for CopyManifestTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let result = async {
            let source = input.recipe.manifest_source()?;
            let host = resolve_source(&input.context_dir, source)?;
            if !host.is_file() {
                return Err(LayerkitError::Path(format!(
                    "dependency manifest '{}' is not a regular file",
                    source
                )));
            }
            let [_, _, created_by, ..] = input.recipe.step_lines();
            run_copy(&input, task_name, input.recipe.manifest.clone(), created_by).await
        }
        .await;
        let (key, step, status) =
            result.inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "copy_manifest"
    }
}
