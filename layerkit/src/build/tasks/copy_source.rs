//! Task: copy the application source tree.

use super::workdir::normalize_workdir;
use super::{
    BuildCtx, StepInput, StepStatus, blocking, finish_step, image_rel, log_task_error, task_start,
};
use crate::cache::{CachedStep, KeyBuilder, digest_sources};
use crate::layers::{Digest, LayerWriter, safe_join};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use crate::recipe::CopySpec;
use async_trait::async_trait;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct CopySourceTask;

#[async_trait]
impl PipelineTask<BuildCtx> for CopySourceTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let spec = input.recipe.source.clone();
        let [.., created_by, _, _] = input.recipe.step_lines();
        let (key, step, status) = run_copy(&input, task_name, spec, created_by)
            .await
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "copy_source"
    }
}

/// Shared by both COPY steps: key on the copied content, then build the layer.
pub(super) async fn run_copy(
    input: &StepInput,
    task_name: &str,
    spec: CopySpec,
    created_by: String,
) -> LayerkitResult<(Digest, CachedStep, StepStatus)> {
    let workdir = normalize_workdir(&input.recipe.workdir)?;
    let context = input.context_dir.clone();

    let sources_digest = {
        let context = context.clone();
        let sources = spec.sources.clone();
        blocking(move || digest_sources(&context, &sources)).await?
    };
    let key = KeyBuilder::new(input.parent_key.as_ref(), task_name)
        .field("sources", sources_digest.as_str())
        .field("dest", spec.dest.as_bytes())
        .finish();

    let (step, status) = input
        .cached_or(&key, || async {
            let tmp_dir = input.runtime.layout.tmp_dir();
            let blobs = input.runtime.blobs.clone();
            let layer = blocking(move || {
                let mut writer = LayerWriter::create(&tmp_dir)?;
                write_copy(&mut writer, &context, &spec, &workdir)?;
                blobs.commit_layer(writer.finish()?)
            })
            .await?;
            Ok::<_, LayerkitError>(CachedStep {
                step: task_name.to_string(),
                created_by,
                layer: Some(layer),
            })
        })
        .await?;
    Ok((key, step, status))
}

/// Host path of a context-relative source; missing sources are a `PathError`.
pub(super) fn resolve_source(context: &Path, source: &str) -> LayerkitResult<PathBuf> {
    let host = safe_join(context, Path::new(source)).ok_or_else(|| {
        LayerkitError::Path(format!("source '{}' escapes the build context", source))
    })?;
    if std::fs::symlink_metadata(&host).is_err() {
        return Err(LayerkitError::Path(format!(
            "source '{}' not found in build context {}",
            source,
            context.display()
        )));
    }
    Ok(host)
}

/// Add every source of `spec` to `writer` at its in-image destination.
///
/// A directory source contributes its contents; a file source lands inside
/// the destination when that names a directory, or at it otherwise.
fn write_copy(
    writer: &mut LayerWriter,
    context: &Path,
    spec: &CopySpec,
    workdir: &Path,
) -> LayerkitResult<()> {
    let dest = image_rel(&spec.dest_in(workdir));
    let dest_is_dir = spec.dest_is_dir(context);

    for source in &spec.sources {
        let host = resolve_source(context, source)?;
        if host.is_dir() || !dest_is_dir {
            writer.add_tree(&host, &dest)?;
        } else {
            let name = host.file_name().ok_or_else(|| {
                LayerkitError::Path(format!("source '{}' has no file name", source))
            })?;
            writer.add_tree(&host, &dest.join(name))?;
        }
    }
    Ok(())
}
