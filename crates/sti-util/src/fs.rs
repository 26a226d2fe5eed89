//! Filesystem utilities for sti.

use std::path::{Path, PathBuf};

use crate::error::UtilError;

fn io_error(path: &Path, source: std::io::Error) -> UtilError {
    UtilError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Create a directory and all parent directories if they do not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), UtilError> {
    std::fs::create_dir_all(path).map_err(|source| io_error(path, source))
}

/// Create a single directory readable only by the current user (mode 0700).
///
/// The parent must already exist. An existing directory is an error, so a
/// stale artifact tree from an earlier run is never silently reused.
///
/// # Errors
/// Returns an error if the directory exists or cannot be created.
pub fn create_private_dir(path: &Path) -> Result<(), UtilError> {
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|source| io_error(path, source))
}

/// Resolve `path` to an absolute, symlink-free path.
///
/// Bind mounts are interpreted by the engine host, which has no notion of
/// our working directory.
///
/// # Errors
/// Returns an error if the path does not exist.
pub fn absolute(path: &Path) -> Result<PathBuf, UtilError> {
    path.canonicalize().map_err(|source| io_error(path, source))
}

/// Collect every regular file under `dir`, recursively, as paths relative
/// to `dir`, sorted.
///
/// Directories are descended into but never returned. Symlinks and other
/// special files are skipped.
///
/// # Errors
/// Returns an error if any directory cannot be read.
pub fn collect_regular_files(dir: &Path) -> Result<Vec<PathBuf>, UtilError> {
    let mut files = Vec::new();
    collect_recursive(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_recursive(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), UtilError> {
    let entries = std::fs::read_dir(dir).map_err(|source| io_error(dir, source))?;

    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|source| io_error(&path, source))?;

        if file_type.is_dir() {
            collect_recursive(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }

    Ok(())
}
