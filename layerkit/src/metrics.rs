//! Runtime-wide counters.
//!
//! Counters are monotonic `AtomicU64`s shared by every clone of the
//! storage; `RuntimeMetrics` is the read-only view handed to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct RuntimeMetricsStorage {
    pub(crate) builds_total: Arc<AtomicU64>,
    pub(crate) builds_failed: Arc<AtomicU64>,
    pub(crate) steps_cached: Arc<AtomicU64>,
    pub(crate) steps_executed: Arc<AtomicU64>,
    pub(crate) launches_total: Arc<AtomicU64>,
    pub(crate) launches_failed: Arc<AtomicU64>,
}

impl RuntimeMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    storage: RuntimeMetricsStorage,
}

impl RuntimeMetrics {
    pub(crate) fn new(storage: RuntimeMetricsStorage) -> Self {
        Self { storage }
    }

    /// Builds started, successful or not.
    pub fn builds_total(&self) -> u64 {
        self.storage.builds_total.load(Ordering::Relaxed)
    }

    pub fn builds_failed(&self) -> u64 {
        self.storage.builds_failed.load(Ordering::Relaxed)
    }

    /// Steps satisfied from the build cache.
    pub fn steps_cached(&self) -> u64 {
        self.storage.steps_cached.load(Ordering::Relaxed)
    }

    pub fn steps_executed(&self) -> u64 {
        self.storage.steps_executed.load(Ordering::Relaxed)
    }

    pub fn launches_total(&self) -> u64 {
        self.storage.launches_total.load(Ordering::Relaxed)
    }

    /// Launches that failed before or while starting the process.
    pub fn launches_failed(&self) -> u64 {
        self.storage.launches_failed.load(Ordering::Relaxed)
    }
}
