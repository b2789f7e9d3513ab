//! Process-wide logging setup.
//!
//! Logs go to a daily file under `<home>/logs` (filtered by `RUST_LOG`,
//! default `info`) and warnings also go to stderr. Only the first runtime
//! in a process installs the subscriber.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::runtime::layout::{FilesystemLayout, filenames};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init_logging_for(layout: &FilesystemLayout) -> LayerkitResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(filenames::LOG_PREFIX)
        .filename_suffix("log")
        .build(layout.logs_dir())
        .map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to open log directory {}: {}",
                layout.logs_dir().display(),
                e
            ))
        })?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    // Fails when a subscriber is already installed (tests, embedding apps).
    if tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok()
    {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
