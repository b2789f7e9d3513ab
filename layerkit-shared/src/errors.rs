//! Error taxonomy for image builds and process launches.
//!
//! The first four variants map one-to-one onto the phases that can fail:
//! resolving the base environment, preparing the working directory,
//! installing dependencies and resolving the launch entry point. Everything
//! else is plumbing around them.

use thiserror::Error;

pub type LayerkitResult<T> = Result<T, LayerkitError>;

#[derive(Debug, Error)]
pub enum LayerkitError {
    /// Base environment reference is unknown or not pinned.
    #[error("base environment resolution failed: {0}")]
    Resolution(String),

    /// Working directory (or a copy destination) cannot be created.
    #[error("path error: {0}")]
    Path(String),

    /// Manifest could not be parsed or the installer failed.
    #[error("dependency install failed: {0}")]
    DependencyInstall(String),

    /// Startup reference (`module:attribute`) or launcher program unresolvable.
    #[error("entry point error: {0}")]
    EntryPoint(String),

    /// Recipe file syntax or step order is invalid.
    #[error("recipe error: {0}")]
    Recipe(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The launched process could not be started or waited on.
    #[error("launch error: {0}")]
    Launch(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LayerkitError {
    /// Short stable name of the error kind, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            LayerkitError::Resolution(_) => "ResolutionError",
            LayerkitError::Path(_) => "PathError",
            LayerkitError::DependencyInstall(_) => "DependencyInstallError",
            LayerkitError::EntryPoint(_) => "EntryPointError",
            LayerkitError::Recipe(_) => "RecipeError",
            LayerkitError::Config(_) => "ConfigError",
            LayerkitError::Storage(_) => "StorageError",
            LayerkitError::Database(_) => "DatabaseError",
            LayerkitError::NotFound(_) => "NotFound",
            LayerkitError::Launch(_) => "LaunchError",
            LayerkitError::Internal(_) => "InternalError",
            LayerkitError::Io(_) => "IoError",
            LayerkitError::Json(_) => "JsonError",
        }
    }
}
