//! Engine directory management.
//!
//! This module handles the file system layout for EntiStore:
//!
//! ```text
//! <engine_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ entities.dat      # Entity log
//! ├─ toc.snapshot      # Table of contents, present only after a clean close
//! └─ indexes/
//!    └─ <name>.idx     # One mutation log per secondary index
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const ENTITY_FILE: &str = "entities.dat";
const TOC_FILE: &str = "toc.snapshot";
const TOC_TEMP: &str = "toc.snapshot.tmp";
const INDEXES_DIR: &str = "indexes";

/// Holds the engine directory and its lock.
///
/// Only one `EngineDir` can exist per directory at a time, across processes.
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    /// Held for exclusive access; released when the file closes.
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates an engine directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "engine directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        fs::create_dir_all(path.join(INDEXES_DIR))?;
        debug!(path = %path.display(), "locked engine directory");
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the entity log.
    #[must_use]
    pub fn entity_path(&self) -> PathBuf {
        self.path.join(ENTITY_FILE)
    }

    /// Returns the path of the TOC snapshot.
    #[must_use]
    pub fn toc_path(&self) -> PathBuf {
        self.path.join(TOC_FILE)
    }

    /// Returns the directory holding index logs.
    #[must_use]
    pub fn indexes_dir(&self) -> PathBuf {
        self.path.join(INDEXES_DIR)
    }

    /// Reads and deletes the TOC snapshot.
    ///
    /// The snapshot only describes the log as it was at close, so it is
    /// removed before any write can make it stale.
    pub fn take_toc_snapshot(&self) -> CoreResult<Option<Vec<u8>>> {
        let path = self.toc_path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        self.sync_directory()?;
        Ok(Some(data))
    }

    /// Saves the TOC snapshot atomically.
    ///
    /// Write to a temporary file, sync it, rename it into place, then sync
    /// the directory so the rename is durable.
    pub fn save_toc_snapshot(&self, data: &[u8]) -> CoreResult<()> {
        let temp_path = self.path.join(TOC_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.toc_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; directories cannot be fsynced here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_engine");

        let dir = EngineDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(dir.indexes_dir().is_dir());
        assert_eq!(dir.entity_path(), path.join("entities.dat"));
        assert_eq!(dir.toc_path(), path.join("toc.snapshot"));
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = EngineDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");
        let _dir = EngineDir::open(&path, true).unwrap();
        assert!(matches!(
            EngineDir::open(&path, true),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("reopen");
        drop(EngineDir::open(&path, true).unwrap());
        let _again = EngineDir::open(&path, true).unwrap();
    }

    #[test]
    fn snapshot_is_consumed_once() {
        let temp = tempdir().unwrap();
        let dir = EngineDir::open(temp.path(), true).unwrap();
        assert_eq!(dir.take_toc_snapshot().unwrap(), None);

        dir.save_toc_snapshot(b"toc bytes").unwrap();
        assert!(!temp.path().join(TOC_TEMP).exists());
        assert_eq!(
            dir.take_toc_snapshot().unwrap(),
            Some(b"toc bytes".to_vec())
        );
        assert_eq!(dir.take_toc_snapshot().unwrap(), None);
    }
}
