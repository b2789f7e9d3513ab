//! Build step trait and the per-step bookkeeping the executor keeps.

use std::fmt;

use async_trait::async_trait;
use layerkit_shared::errors::LayerkitResult;

use crate::layers::Digest;

/// Position of a task in the whole plan, counted across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepIndex {
    /// Zero-based.
    pub position: usize,
    pub total: usize,
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.position + 1, self.total)
    }
}

/// What a finished step reports back to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Build cache key the step's result is stored under.
    pub cache_key: Option<Digest>,
    /// The result was reused from the build cache.
    pub cached: bool,
}

impl TaskOutcome {
    pub fn keyed(cache_key: Digest, cached: bool) -> Self {
        Self {
            cache_key: Some(cache_key),
            cached,
        }
    }
}

/// One step of a build plan.
///
/// Steps share a context and run strictly one after another, so each sees
/// the layers and cache key chain exactly as the previous step left them.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx, index: StepIndex) -> LayerkitResult<TaskOutcome>;

    /// Step name used in reports, logs and cache keys.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_index_is_one_based_for_display() {
        let index = StepIndex {
            position: 3,
            total: 7,
        };
        assert_eq!(index.to_string(), "4/7");
    }
}
