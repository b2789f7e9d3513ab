//! Task: run the dependency install command.
//!
//! The command runs against a staged copy of the root filesystem built
//! from the lower layers. Whatever it changes under that root becomes the
//! step's layer. The step key chains off the manifest copy, so it is
//! reused until the manifest (or anything below it) changes.

use super::workdir::normalize_workdir;
use super::{BuildCtx, StepInput, blocking, finish_step, log_task_error, task_start};
use crate::cache::{CachedStep, KeyBuilder};
use crate::launch::{find_program, search_path};
use crate::layers::{LayerDescriptor, LayerWriter, Snapshot, extract_layers, safe_join};
use crate::pipeline::{PipelineTask, StepIndex, TaskOutcome};
use crate::recipe::Manifest;
use async_trait::async_trait;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Lines of installer output kept in the error message.
const OUTPUT_TAIL_LINES: usize = 20;

pub struct InstallTask;

#[async_trait]
impl PipelineTask<BuildCtx> for InstallTask {
    async fn run(self: Box<Self>, ctx: BuildCtx, index: StepIndex) -> LayerkitResult<TaskOutcome> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name, index).await;
        let input = StepInput::capture(&ctx).await;
        let started = Instant::now();

        let result = async {
            warn_unpinned(&input)?;

            let argv = &input.recipe.install;
            let argv_json = serde_json::to_vec(argv)?;
            let key = KeyBuilder::new(input.parent_key.as_ref(), task_name)
                .field("argv", argv_json)
                .finish();
            let [_, _, _, created_by, ..] = input.recipe.step_lines();

            let (step, status) = input
                .cached_or(&key, || async {
                    let layer = run_install(&input, argv).await?;
                    Ok::<_, LayerkitError>(CachedStep {
                        step: task_name.to_string(),
                        created_by,
                        layer: Some(layer),
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
        "install_dependencies"
    }
}

/// Warn about floating requirements. The installer alone decides whether
/// the manifest is valid, so an unreadable or odd manifest is not an error.
fn warn_unpinned(input: &StepInput) -> LayerkitResult<()> {
    let source = input.recipe.manifest_source()?;
    let path = safe_join(&input.context_dir, Path::new(source)).ok_or_else(|| {
        LayerkitError::Path(format!("manifest '{}' escapes the build context", source))
    })?;
    let manifest = match Manifest::from_file(&path) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!(manifest = source, error = %e, "Cannot read manifest for pin check");
            return Ok(());
        }
    };

    let unpinned: Vec<String> = manifest.unpinned().map(ToString::to_string).collect();
    if !unpinned.is_empty() {
        tracing::warn!(
            manifest = source,
            requirements = ?unpinned,
            "Unpinned requirements, install results may drift over time"
        );
    }
    if !manifest.skipped.is_empty() {
        tracing::debug!(
            manifest = source,
            lines = ?manifest.skipped,
            "Manifest lines not checked for pins"
        );
    }
    Ok(())
}

async fn run_install(input: &StepInput, argv: &[String]) -> LayerkitResult<LayerDescriptor> {
    let workdir = normalize_workdir(&input.recipe.workdir)?;
    let staging = tempfile::Builder::new()
        .prefix("build-")
        .tempdir_in(input.runtime.layout.tmp_dir())?;
    let rootfs = staging.path().join("rootfs");

    let before = {
        let rootfs = rootfs.clone();
        let layers = input.layer_paths();
        blocking(move || {
            std::fs::create_dir_all(&rootfs)?;
            extract_layers(layers.iter().map(|p| p.as_path()), &rootfs)?;
            Snapshot::capture(&rootfs)
        })
        .await?
    };

    let cwd = safe_join(&rootfs, workdir.strip_prefix("/").unwrap_or(&workdir)).ok_or_else(
        || LayerkitError::Path(format!("invalid working directory {}", workdir.display())),
    )?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LayerkitError::Recipe("RUN has an empty command".into()))?;
    let program = find_program(program, &rootfs, &workdir).ok_or_else(|| {
        LayerkitError::DependencyInstall(format!(
            "install program '{}' not found in image or on host PATH",
            program
        ))
    })?;

    tracing::debug!(program = %program.display(), cwd = %cwd.display(), "Running install command");
    let output = Command::new(&program)
        .args(args)
        .current_dir(&cwd)
        .env("PATH", search_path(&rootfs))
        .env("LAYERKIT_ROOTFS", &rootfs)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            LayerkitError::DependencyInstall(format!(
                "failed to start {}: {}",
                program.display(),
                e
            ))
        })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(LayerkitError::DependencyInstall(format!(
            "install command exited with {}:\n{}",
            output.status,
            tail(&combined, OUTPUT_TAIL_LINES)
        )));
    }

    let tmp_dir = input.runtime.layout.tmp_dir();
    let blobs = input.runtime.blobs.clone();
    let layer = blocking(move || {
        let after = Snapshot::capture(&rootfs)?;
        let changes = before.diff(&after);
        tracing::debug!(changes = changes.len(), "Install command changed root filesystem");
        let mut writer = LayerWriter::create(&tmp_dir)?;
        after.write_changes(&rootfs, &changes, &mut writer)?;
        blobs.commit_layer(writer.finish()?)
    })
    .await?;

    drop(staging);
    Ok(layer)
}

/// Last `n` non-empty lines of `text`.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
