//! Home directory layout.
//!
//! ```text
//! <home>/
//!   blobs/sha256/   layer, config and manifest blobs
//!   db/layerkit.db  cache, image and base indexes
//!   tmp/            staging roots and in-progress layers
//!   containers/     ephemeral container root filesystems
//!   logs/           daily log files
//!   .lock           runtime lock
//! ```

use std::path::{Path, PathBuf};

pub mod filenames {
    pub const DB: &str = "layerkit.db";
    pub const LOCK: &str = ".lock";
    pub const LOG_PREFIX: &str = "layerkit";
}

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.home_dir.join("blobs").join("sha256")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(filenames::DB)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home_dir.join("tmp")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.home_dir.join("containers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home_dir.join(filenames::LOCK)
    }

    /// Create every directory of the layout.
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [
            self.blobs_dir(),
            self.db_dir(),
            self.tmp_dir(),
            self.containers_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_directories() {
        let home = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(home.path().to_path_buf());
        layout.prepare().unwrap();

        assert!(layout.blobs_dir().ends_with("blobs/sha256"));
        for dir in [
            layout.blobs_dir(),
            layout.db_dir(),
            layout.tmp_dir(),
            layout.containers_dir(),
            layout.logs_dir(),
        ] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
    }
}
