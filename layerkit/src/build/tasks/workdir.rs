//! Task: establish the working directory.
//!
//! The directory (and its parents) become a small layer. Fails with
//! `PathError` when the path is relative, climbs with `..`, or runs into
//! a file or symlink that lower layers placed on the way.

use super::{BuildCtx, StepInput, blocking, finish_step, image_rel, log_task_error, task_start};
use crate::cache::{CachedStep, KeyBuilder};
use crate::layers::{EntryKind, LayerWriter, list_entries};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use async_trait::async_trait;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

pub struct WorkdirTask;

#[async_trait]
impl PipelineTask<BuildCtx> for WorkdirTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let workdir = normalize_workdir(&input.recipe.workdir)
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;
        let key = KeyBuilder::new(input.parent_key.as_ref(), task_name)
            .field("path", workdir.to_string_lossy().as_bytes())
            .finish();
        let created_by = format!("WORKDIR {}", workdir.display());

        let (step, status) = input
            .cached_or(&key, || async {
                let rel = image_rel(&workdir);
                if rel.as_os_str().is_empty() {
                    return Ok::<_, LayerkitError>(CachedStep {
                        step: task_name.to_string(),
                        created_by,
                        layer: None,
                    });
                }

                let lower = input.layer_paths();
                let tmp_dir = input.runtime.layout.tmp_dir();
                let blobs = input.runtime.blobs.clone();
                let layer = blocking(move || {
                    check_no_conflict(&lower, &rel)?;
                    let mut writer = LayerWriter::create(&tmp_dir)?;
                    writer.add_dir(&rel)?;
                    blobs.commit_layer(writer.finish()?)
                })
                .await?;

                Ok::<_, LayerkitError>(CachedStep {
                    step: task_name.to_string(),
                    created_by,
                    layer: Some(layer),
                })
            })
            .await
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        finish_step(&ctx, key, step, status, started).await
    }

    fn name(&self) -> &str {
        "workdir"
    }
}

/// Absolute path with `.` and trailing separators removed.
pub(crate) fn normalize_workdir(path: &Path) -> LayerkitResult<PathBuf> {
    if !path.is_absolute() {
        return Err(LayerkitError::Path(format!(
            "working directory '{}' must be absolute",
            path.display()
        )));
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(LayerkitError::Path(format!(
                    "working directory '{}' must not contain '..'",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Merged view of entry kinds across `layers`, honoring whiteouts.
fn merged_entries(layers: &[PathBuf]) -> LayerkitResult<BTreeMap<PathBuf, EntryKind>> {
    let mut merged: BTreeMap<PathBuf, EntryKind> = BTreeMap::new();
    for layer in layers {
        for (path, kind) in list_entries(layer)? {
            let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();
            match kind {
                EntryKind::OpaqueWhiteout => {
                    merged.retain(|p, _| !(p.starts_with(&parent) && *p != parent));
                }
                EntryKind::Whiteout => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let target = parent.join(&name[crate::layers::WHITEOUT_PREFIX.len()..]);
                    merged.retain(|p, _| !p.starts_with(&target));
                }
                _ => {
                    merged.insert(path, kind);
                }
            }
        }
    }
    Ok(merged)
}

fn check_no_conflict(layers: &[PathBuf], rel: &Path) -> LayerkitResult<()> {
    let merged = merged_entries(layers)?;
    let mut ancestors: Vec<&Path> = rel.ancestors().filter(|p| !p.as_os_str().is_empty()).collect();
    ancestors.reverse();
    for path in ancestors {
        match merged.get(path) {
            None | Some(EntryKind::Directory) => {}
            Some(kind) => {
                return Err(LayerkitError::Path(format!(
                    "cannot create working directory: /{} already exists as {:?} in a lower layer",
                    path.display(),
                    kind
                )));
            }
        }
    }
    Ok(())
}
