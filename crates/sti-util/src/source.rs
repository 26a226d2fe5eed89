//! Source retrieval: version-control clones and attribute-preserving copies.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::UtilError;
use crate::process::{ensure_success, run_command};

/// Capability for fetching application sources into a build context.
pub trait SourceFetcher {
    /// Clone the repository at `url` into `dest`, which must not exist yet.
    ///
    /// # Errors
    /// Returns an error if the clone fails.
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), UtilError>;

    /// Copy the tree at `src` to `dest`, preserving modes and timestamps.
    ///
    /// # Errors
    /// Returns an error if the copy fails.
    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), UtilError>;
}

/// Return `true` if `source` names a version-control repository rather than
/// a local path.
///
/// Recognises `git://`, `ssh://`, `file://`, scp-style `git@host:path`, and
/// `http(s)://` URLs ending in `.git`.
pub fn is_vcs_url(source: &str) -> bool {
    if ["git://", "ssh://", "file://", "git@"]
        .iter()
        .any(|prefix| source.starts_with(prefix))
    {
        return true;
    }
    (source.starts_with("http://") || source.starts_with("https://"))
        && source.trim_end_matches('/').ends_with(".git")
}

/// `SourceFetcher` backed by the `git` and `cp` executables on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellSource;

impl SourceFetcher for ShellSource {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), UtilError> {
        debug!(url, dest = %dest.display(), "cloning source");
        let output = run_command(
            Command::new("git")
                .arg("clone")
                .arg("--quiet")
                .arg(url)
                .arg(dest),
        )?;
        ensure_success("git clone", output).map(|_| ())
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), UtilError> {
        debug!(src = %src.display(), dest = %dest.display(), "copying source tree");
        let output = run_command(Command::new("cp").arg("-a").arg(src).arg(dest))?;
        ensure_success("cp", output).map(|_| ())
    }
}
