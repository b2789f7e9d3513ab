//! Generic pipeline execution framework.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::Stage;
use super::task::{BoxedTask, StepIndex};
use layerkit_shared::errors::LayerkitResult;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// Pipeline executor framework.
///
/// This provides the generic infrastructure for executing a table-driven pipeline.
/// The actual task execution logic is provided by task implementations.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// Stages and their tasks run strictly in order; the first error
    /// aborts the remaining tasks and is returned as-is.
    ///
    /// Generic over:
    /// - `Ctx`: Shared pipeline context (use interior mutability for writes)
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> LayerkitResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();
        let total = pipeline.stages.iter().map(|stage| stage.tasks.len()).sum();
        let mut position = 0;

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let stage_start = Instant::now();
            tracing::debug!(stage = stage.name, index, "Pipeline stage starting");

            let mut task_metrics = Vec::new();
            for task in stage.tasks {
                let name = task.name().to_string();
                let index = StepIndex { position, total };
                let task_start = Instant::now();
                let outcome = task.run(ctx.clone(), index).await?;
                task_metrics.push(TaskMetrics {
                    name,
                    index,
                    cached: outcome.cached,
                    cache_key: outcome.cache_key,
                    duration_ms: task_start.elapsed().as_millis(),
                });
                position += 1;
            }

            stage_metrics.push(StageMetrics {
                index,
                name: stage.name,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}
