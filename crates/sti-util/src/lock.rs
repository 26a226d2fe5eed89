//! Exclusive, non-blocking file locks.
//!
//! Acquisition never waits: if another open handle already holds the lock
//! the call fails immediately with `UtilError::LockContention`. The lock is
//! released when the returned `ExclusiveFile` is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::UtilError;

/// A file opened for writing and held under an exclusive advisory lock.
#[derive(Debug)]
pub struct ExclusiveFile {
    file: File,
    path: PathBuf,
}

impl ExclusiveFile {
    /// Open (creating if needed) `path` and take an exclusive lock on it
    /// without blocking.
    ///
    /// The file is not truncated until the lock is held, so a losing
    /// contender never clobbers the winner's content.
    ///
    /// # Errors
    /// Returns `UtilError::LockContention` if another handle holds the lock,
    /// `UtilError::Io` if the file cannot be opened, and `UtilError::Lock`
    /// if locking fails for any other reason.
    pub fn acquire(path: &Path) -> Result<Self, UtilError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o700);
        }
        let file = options.open(path).map_err(|source| UtilError::Io {
            path: path.display().to_string(),
            source,
        })?;

        if let Err(err) = try_lock_exclusive(&file) {
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(UtilError::LockContention {
                    path: path.display().to_string(),
                });
            }
            return Err(UtilError::Lock {
                path: path.display().to_string(),
                source: err,
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Replace the whole file content with `content`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be truncated or written.
    pub fn replace_contents(&self, content: &[u8]) -> Result<(), UtilError> {
        let io_err = |source| UtilError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let mut file = &self.file;
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        file.write_all(content).map_err(io_err)?;
        file.flush().map_err(io_err)
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};

    flock(file, FlockOperation::NonBlockingLockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "exclusive file locks are only supported on unix hosts",
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dockerfile");
        let lock = ExclusiveFile::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn second_acquire_fails_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dockerfile");
        let _held = ExclusiveFile::acquire(&path).unwrap();

        let err = ExclusiveFile::acquire(&path).unwrap_err();
        assert!(
            matches!(err, UtilError::LockContention { .. }),
            "error was: {err}"
        );
    }

    #[test]
    fn lock_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dockerfile");
        {
            let _lock = ExclusiveFile::acquire(&path).unwrap();
        }
        assert!(ExclusiveFile::acquire(&path).is_ok());
    }

    #[test]
    fn contention_does_not_clobber_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dockerfile");
        let held = ExclusiveFile::acquire(&path).unwrap();
        held.replace_contents(b"FROM first\n").unwrap();

        assert!(ExclusiveFile::acquire(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "FROM first\n");
    }

    #[test]
    fn replace_contents_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Dockerfile");
        std::fs::write(&path, "a much longer stale manifest\n").unwrap();

        let lock = ExclusiveFile::acquire(&path).unwrap();
        lock.replace_contents(b"short\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short\n");
    }
}
