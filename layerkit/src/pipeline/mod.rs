//! Table-driven pipeline execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs every stage in order, stopping at the first error
//! - Stage: named group of tasks
//! - Task: one build step sharing one context, reporting its cache key
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::new("base", vec![Box::new(ResolveBaseTask), Box::new(WorkdirTask)]),
//! ]);
//!
//! let ctx = Arc::new(Mutex::new(BuildPipelineContext::new(..)));
//! let pipeline = PipelineBuilder::from_plan(plan);
//! let metrics = PipelineExecutor::execute(pipeline, ctx).await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::Stage;
pub use task::{BoxedTask, PipelineTask, StepIndex, TaskOutcome};
