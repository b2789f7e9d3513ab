//! Runtime, build and launch options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use crate::images::validate_name;
use crate::recipe::DEFAULT_RECIPE_FILE;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "LAYERKIT_HOME";

const DEFAULT_HOME_DIR: &str = ".layerkit";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerkitOptions {
    pub home_dir: PathBuf,
}

impl Default for LayerkitOptions {
    fn default() -> Self {
        let home_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(DEFAULT_HOME_DIR)
            });
        Self { home_dir }
    }
}

impl LayerkitOptions {
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Build context directory.
    pub context: PathBuf,
    /// Recipe path; defaults to `<context>/Dockerfile`.
    pub recipe_file: Option<PathBuf>,
    /// Image name; defaults to `<context dir name>:latest`.
    pub tag: Option<String>,
    /// Skip cache lookups (results are still recorded).
    pub no_cache: bool,
}

impl BuildOptions {
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn sanitize(&self) -> LayerkitResult<()> {
        if !self.context.is_dir() {
            return Err(LayerkitError::Path(format!(
                "build context {} is not a directory",
                self.context.display()
            )));
        }
        validate_name(&self.image_name())?;
        Ok(())
    }

    pub fn recipe_path(&self) -> PathBuf {
        match &self.recipe_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.context.join(path),
            None => self.context.join(DEFAULT_RECIPE_FILE),
        }
    }

    pub fn image_name(&self) -> String {
        if let Some(tag) = &self.tag {
            return tag.clone();
        }
        format!("{}:{}", default_repository(&self.context), DEFAULT_TAG)
    }
}

/// Lowercased context directory name with unsupported characters replaced.
fn default_repository(context: &Path) -> String {
    let name = context
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let cleaned: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Leave the container root filesystem on disk after exit.
    pub keep_rootfs: bool,
}
