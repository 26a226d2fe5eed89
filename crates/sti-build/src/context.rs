//! Build context assembly: stage the source, render the manifest, and pack
//! the context directory into the archive handed to the engine.

use std::fs::{self, File};
use std::path::Path;
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;
use tracing::debug;

use sti_config::EnvVar;
use sti_util::error::UtilError;
use sti_util::fs::collect_regular_files;
use sti_util::lock::ExclusiveFile;
use sti_util::source::{is_vcs_url, SourceFetcher};

use crate::error::{ErrorKind, StiError};

/// Name of the rendered build manifest inside a context directory.
pub const MANIFEST_NAME: &str = "Dockerfile";
/// Context subdirectory holding the application source.
pub const SOURCE_DIR: &str = "src";
/// Context subdirectory holding artifacts from a prior build.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Stage `source` at `dest`: clone it when it is a version-control URL,
/// otherwise copy the local tree preserving attributes.
///
/// # Errors
/// Returns `ErrorKind::BuildFailed` if `dest` already exists or the clone or
/// copy fails.
pub fn prepare_source(fetcher: &dyn SourceFetcher, source: &str, dest: &Path) -> Result<(), StiError> {
    let failed = || {
        StiError::new(
            ErrorKind::BuildFailed,
            format!("staging source {source} into {}", dest.display()),
        )
    };

    if dest.exists() {
        return Err(failed().with_source(UtilError::Io {
            path: dest.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination exists"),
        }));
    }

    let result = if is_vcs_url(source) {
        fetcher.clone_repo(source, dest)
    } else {
        fetcher.copy_tree(Path::new(source), dest)
    };
    result.map_err(|e| failed().with_source(e))
}

/// Render the build manifest text.
///
/// Directive order is fixed: `FROM`, `ADD ./src`, the artifacts `ADD` when
/// incremental, one `ENV` per entry in the given order, `RUN`, `CMD`.
pub fn manifest_text(base_image: &str, environment: &[EnvVar], incremental: bool) -> String {
    let mut text = format!("FROM {base_image}\nADD ./{SOURCE_DIR} /usr/src\n");
    if incremental {
        text.push_str("ADD ./artifacts /usr/artifacts\n");
    }
    for env in environment {
        text.push_str(&format!("ENV {} {}\n", env.name, env.value));
    }
    text.push_str("RUN /usr/bin/prepare\nCMD /usr/bin/run\n");
    text
}

/// A context directory's manifest held under an exclusive lock.
///
/// Keep it alive until the engine build has finished; dropping it releases
/// the lock.
#[derive(Debug)]
pub struct ManifestGuard {
    file: ExclusiveFile,
}

impl ManifestGuard {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Replace the manifest content with the rendered template.
    ///
    /// # Errors
    /// Returns `ErrorKind::CreateManifestFailed` if the file cannot be written.
    pub fn write(&self, base_image: &str, environment: &[EnvVar], incremental: bool) -> Result<(), StiError> {
        self.file
            .replace_contents(manifest_text(base_image, environment, incremental).as_bytes())
            .map_err(|e| manifest_failed(self.path(), e))?;
        debug!(path = %self.path().display(), "wrote build manifest");
        Ok(())
    }
}

fn manifest_failed(path: &Path, source: UtilError) -> StiError {
    StiError::new(ErrorKind::CreateManifestFailed, path.display().to_string()).with_source(source)
}

/// Lock the manifest of `context_dir` without writing it yet.
///
/// Acquisition never blocks: if another build holds the manifest the call
/// fails immediately and leaves the existing content untouched.
///
/// # Errors
/// Returns `ErrorKind::CreateManifestFailed` if the file cannot be opened
/// or locked.
pub fn lock_manifest(context_dir: &Path) -> Result<ManifestGuard, StiError> {
    let path = context_dir.join(MANIFEST_NAME);
    let file = ExclusiveFile::acquire(&path).map_err(|e| manifest_failed(&path, e))?;
    Ok(ManifestGuard { file })
}

/// Write the manifest into `context_dir`, holding an exclusive lock on it.
///
/// # Errors
/// Returns `ErrorKind::CreateManifestFailed` if the file cannot be opened,
/// locked or written.
pub fn render_manifest(
    context_dir: &Path,
    base_image: &str,
    environment: &[EnvVar],
    incremental: bool,
) -> Result<ManifestGuard, StiError> {
    let guard = lock_manifest(context_dir)?;
    guard.write(base_image, environment, incremental)?;
    Ok(guard)
}

/// A packed build context, deleted when dropped.
#[derive(Debug)]
pub struct ContextArchive {
    file: NamedTempFile,
    entries: usize,
}

impl ContextArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of files in the archive.
    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Pack every regular file under `context_dir` into a tar archive.
///
/// Entry names are relative to `context_dir`; each entry keeps the file's
/// size, mode and modification time. Directories themselves are not
/// archived. The archive is written outside `context_dir`.
///
/// # Errors
/// Returns `ErrorKind::BuildFailed` if the directory cannot be walked or
/// the archive cannot be written.
pub fn package(context_dir: &Path) -> Result<ContextArchive, StiError> {
    let failed = |e: UtilError| {
        StiError::new(
            ErrorKind::BuildFailed,
            format!("packaging build context {}", context_dir.display()),
        )
        .with_source(e)
    };
    let io_failed = |path: &Path, source: std::io::Error| {
        failed(UtilError::Io {
            path: path.display().to_string(),
            source,
        })
    };

    let files = collect_regular_files(context_dir).map_err(failed)?;
    let temp = tempfile::Builder::new()
        .prefix("sti-context-")
        .suffix(".tar")
        .tempfile()
        .map_err(|e| io_failed(&std::env::temp_dir(), e))?;

    {
        let mut builder = tar::Builder::new(temp.as_file());
        for relative in &files {
            let path = context_dir.join(relative);
            let metadata = fs::metadata(&path).map_err(|e| io_failed(&path, e))?;

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(file_mode(&metadata));
            header.set_mtime(
                metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs()),
            );

            let mut content = File::open(&path).map_err(|e| io_failed(&path, e))?;
            builder
                .append_data(&mut header, relative, &mut content)
                .map_err(|e| io_failed(&path, e))?;
        }
        builder.finish().map_err(|e| io_failed(temp.path(), e))?;
    }

    debug!(
        context = %context_dir.display(),
        archive = %temp.path().display(),
        entries = files.len(),
        "packed build context"
    );
    Ok(ContextArchive {
        file: temp,
        entries: files.len(),
    })
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
