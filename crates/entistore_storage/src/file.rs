//! Durable backend over a single OS file.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Open file handle plus the logical length of the log.
///
/// Both live under one lock: every access seeks before reading or writing,
/// so the length must never be observed half way through an append.
#[derive(Debug)]
struct Handle {
    file: File,
    len: u64,
}

impl Handle {
    fn at(&mut self, offset: u64) -> io::Result<&mut File> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(&mut self.file)
    }
}

/// Entity log stored in a regular file.
///
/// `flush` hands buffered bytes to the OS; `sync` waits until they reach
/// the device. Appends are only crash-safe after a `sync`.
///
/// ```no_run
/// use entistore_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let log = FileBackend::open(Path::new("entities.dat")).unwrap();
/// let at = log.append(b"record").unwrap();
/// log.sync().unwrap();
/// assert_eq!(log.read_at(at, 6).unwrap(), b"record");
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    handle: Mutex<Handle>,
}

impl FileBackend {
    /// Opens the file at `path`, creating an empty one if it is missing.
    ///
    /// Existing content is kept.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_owned(),
            handle: Mutex::new(Handle { file, len }),
        })
    }

    /// Like [`FileBackend::open`], but first creates any missing parent
    /// directories.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
            _ => {}
        }
        Self::open(path)
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut handle = self.handle.lock();
        let size = handle.len;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => {}
            _ => return Err(StorageError::ReadPastEnd { offset, len, size }),
        }
        let mut out = vec![0u8; len];
        if len > 0 {
            handle.at(offset)?.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let mut handle = self.handle.lock();
        let remaining = handle.len.saturating_sub(offset);
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        if n > 0 {
            handle.at(offset)?.read_exact(&mut buf[..n])?;
        }
        Ok(n)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut handle = self.handle.lock();
        let start = handle.len;
        if !data.is_empty() {
            handle.at(start)?.write_all(data)?;
            handle.len = start + data.len() as u64;
        }
        Ok(start)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut handle = self.handle.lock();
        if offset > handle.len {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: data.len(),
                size: handle.len,
            });
        }
        if !data.is_empty() {
            handle.at(offset)?.write_all(data)?;
            handle.len = handle.len.max(offset + data.len() as u64);
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(self.handle.lock().file.flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.handle.lock().len)
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(self.handle.lock().file.sync_all()?)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut handle = self.handle.lock();
        if new_size > handle.len {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: handle.len,
            });
        }
        handle.file.set_len(new_size)?;
        handle.file.sync_all()?;
        handle.len = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let log = FileBackend::open(&dir.path().join("entities.dat")).unwrap();
        (dir, log)
    }

    #[test]
    fn open_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.dat");
        let log = FileBackend::open(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(log.size().unwrap(), 0);
    }

    #[test]
    fn appends_return_their_offsets() {
        let (_dir, log) = scratch();
        assert_eq!(log.append(b"abc").unwrap(), 0);
        assert_eq!(log.append(b"").unwrap(), 3);
        assert_eq!(log.append(b"defg").unwrap(), 3);
        assert_eq!(log.read_at(1, 5).unwrap(), b"bcdef");
    }

    #[test]
    fn write_at_patches_in_place_and_may_grow() {
        let (_dir, log) = scratch();
        log.append(b"record-one").unwrap();
        log.write_at(0, b"R").unwrap();
        log.write_at(7, b"three").unwrap();
        assert_eq!(log.size().unwrap(), 12);
        assert_eq!(log.read_at(0, 12).unwrap(), b"Record-three");
    }

    #[test]
    fn access_beyond_length_is_rejected() {
        let (_dir, log) = scratch();
        log.append(b"abc").unwrap();
        assert!(matches!(
            log.write_at(4, b"x"),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
        assert!(matches!(
            log.read_at(2, 2),
            Err(StorageError::ReadPastEnd { offset: 2, len: 2, size: 3 })
        ));
        assert!(log.read_at(u64::MAX, 1).is_err());
    }

    #[test]
    fn read_into_is_short_at_the_tail() {
        let (_dir, log) = scratch();
        log.append(b"tail").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(log.read_into(1, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ail");
        assert_eq!(log.read_into(4, &mut buf).unwrap(), 0);
        assert_eq!(log.read_into(40, &mut buf).unwrap(), 0);
    }

    #[test]
    fn content_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.dat");
        let log = FileBackend::open(&path).unwrap();
        log.append(b"kept across runs").unwrap();
        log.sync().unwrap();
        drop(log);

        let log = FileBackend::open(&path).unwrap();
        assert_eq!(log.size().unwrap(), 16);
        assert_eq!(log.read_at(5, 6).unwrap(), b"across");
    }

    #[test]
    fn truncate_only_shrinks() {
        let (_dir, log) = scratch();
        log.append(b"0123456789").unwrap();
        log.truncate(4).unwrap();
        assert_eq!(log.size().unwrap(), 4);
        assert_eq!(log.append(b"x").unwrap(), 4);
        assert!(matches!(
            log.truncate(100),
            Err(StorageError::TruncateBeyondEnd { requested: 100, size: 5 })
        ));
    }

    #[test]
    fn missing_parents_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("entities.dat");
        let log = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(log.path(), path);
        assert_eq!(log.size().unwrap(), 0);
    }
}
