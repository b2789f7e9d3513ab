//! Stage definition for table-driven pipeline execution.

/// A named group of tasks.
///
/// Stages run in order and a stage's tasks run one after another, so
/// every task sees the context exactly as the previous one left it.
///
/// Generic over task type T to allow different pipeline implementations.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(name: &'static str, tasks: Vec<T>) -> Self {
        Self { name, tasks }
    }
}
