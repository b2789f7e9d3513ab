//! Type definitions for the build pipeline.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::bases::BaseRecord;
use crate::images::{History, ImageRef};
use crate::layers::{Digest, LayerDescriptor};
use crate::recipe::Recipe;
use crate::runtime::RuntimeInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Reused from the build cache without running.
    Cached,
    Executed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub created_by: String,
    pub status: StepStatus,
    /// Layer produced by the step; `None` for metadata steps.
    pub layer: Option<Digest>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub image: ImageRef,
    pub steps: Vec<StepReport>,
    pub total_duration_ms: u128,
}

impl BuildReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of the steps that actually ran.
    pub fn executed(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Executed)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// RAII guard for build failure accounting.
///
/// Logs the failure and increments the failure counter if dropped
/// without being disarmed. Staging directories clean themselves up.
pub struct BuildGuard {
    runtime: RuntimeInner,
    image_name: String,
    armed: bool,
}

impl BuildGuard {
    pub fn new(runtime: RuntimeInner, image_name: String) -> Self {
        Self {
            runtime,
            image_name,
            armed: true,
        }
    }

    /// Disarm the guard (call on success).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(image = %self.image_name, "Image build failed, no image recorded");

        self.runtime
            .runtime_metrics
            .builds_failed
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared build pipeline context.
///
/// Inputs are fixed at creation; each task appends its layer, history
/// entry and report, and advances `parent_key`.
pub struct BuildPipelineContext {
    pub runtime: RuntimeInner,
    pub recipe: Recipe,
    pub context_dir: PathBuf,
    pub image_name: String,
    pub no_cache: bool,
    pub build_id: String,
    pub guard: BuildGuard,
    /// Key of the last finished step.
    pub parent_key: Option<Digest>,
    pub base: Option<BaseRecord>,
    pub layers: Vec<LayerDescriptor>,
    pub history: Vec<History>,
    pub steps: Vec<StepReport>,
}

impl BuildPipelineContext {
    pub fn new(
        runtime: RuntimeInner,
        recipe: Recipe,
        context_dir: PathBuf,
        image_name: String,
        no_cache: bool,
        build_id: String,
    ) -> Self {
        let guard = BuildGuard::new(runtime.clone(), image_name.clone());
        Self {
            runtime,
            recipe,
            context_dir,
            image_name,
            no_cache,
            build_id,
            guard,
            parent_key: None,
            base: None,
            layers: Vec::new(),
            history: Vec::new(),
            steps: Vec::new(),
        }
    }
}
