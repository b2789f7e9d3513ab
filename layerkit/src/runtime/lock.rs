//! Advisory lock on the home directory.
//!
//! Only one runtime may own a home directory at a time. The lock is an
//! exclusive `flock` on `<home>/.lock`, released when the file closes.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use super::layout::filenames;

#[derive(Debug)]
pub struct RuntimeLock {
    _file: File,
    path: PathBuf,
}

impl RuntimeLock {
    pub fn acquire(home_dir: &Path) -> LayerkitResult<Self> {
        let path = home_dir.join(filenames::LOCK);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => LayerkitError::Config(format!(
                    "another layerkit process is using {}",
                    home_dir.display()
                )),
                _ => LayerkitError::Io(err),
            });
        }

        tracing::debug!(path = %path.display(), "Acquired runtime lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
