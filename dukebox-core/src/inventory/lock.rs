//! Per-entry advisory file locks.
//!
//! Every operation touching one entry directory holds an exclusive
//! OS-level advisory lock on that entry's `lock` file for its whole
//! duration. This is what keeps the store safe under cross-process
//! access: a second acquirer blocks until the first releases and then
//! observes a fully-committed or fully-absent entry, never a partial one.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};

pub(crate) const LOCK_FILE: &str = "lock";

/// An exclusive lock on one entry, released on drop.
#[derive(Debug)]
pub struct EntryLock {
    file: File,
    path: PathBuf,
}

impl EntryLock {
    /// Blocks until the entry's lock file can be locked exclusively.
    /// The lock file is created if absent.
    pub fn acquire(entry_dir: &Path) -> Result<Self> {
        let path = entry_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        file.lock_exclusive().map_err(|e| Error::io(&path, e))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        // Closing the descriptor would release the lock anyway; unlocking
        // explicitly keeps the release visible to tooling.
        let _ = FileExt::unlock(&self.file);
    }
}
