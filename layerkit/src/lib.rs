//! Layerkit: a layered image builder and single-process launcher.
//!
//! A recipe (a small Dockerfile subset) is built into a stack of
//! content-addressed layers with a per-step build cache, then launched
//! as one foreground process on an ephemeral root filesystem.
//!
//! ```ignore
//! use layerkit::{BuildOptions, LaunchOptions, LayerkitRuntime};
//!
//! let runtime = LayerkitRuntime::with_defaults()?;
//! runtime.import_base("python:3.11-slim", "/opt/bases/python-3.11".as_ref()).await?;
//! let report = runtime.build(BuildOptions::new("./refactor-api").tag("refactor-api:latest")).await?;
//! let outcome = runtime.launch(&report.image.name, LaunchOptions::default()).await?;
//! std::process::exit(outcome.exit_code);
//! ```

pub mod bases;
pub mod build;
pub mod cache;
pub mod db;
pub mod images;
pub mod launch;
pub mod layers;
mod logging;
pub mod metrics;
pub mod pipeline;
pub mod recipe;
pub mod runtime;
pub mod util;

pub use logging::init_logging_for;

pub use bases::BaseRecord;
pub use build::{BuildReport, StepReport, StepStatus};
pub use images::{Image, ImageRecord, ImageRef};
pub use launch::{Binding, LaunchOutcome};
pub use metrics::RuntimeMetrics;
pub use recipe::{BaseRef, Manifest, Recipe};
pub use runtime::{BuildOptions, LaunchOptions, LayerkitOptions, LayerkitRuntime};

pub use layerkit_shared::{LayerkitError, LayerkitResult};
