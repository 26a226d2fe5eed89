//! Error types for sti-util.

/// Errors produced by utility functions.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    /// An I/O operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A command failed to execute.
    #[error("cannot execute `{program}`: {source}")]
    CommandExec {
        program: String,
        source: std::io::Error,
    },

    /// A command did not finish within its time budget and was killed.
    #[error("`{program}` did not finish within {seconds}s")]
    Timeout { program: String, seconds: u64 },

    /// A command's output could not be forwarded to its destination.
    #[error("cannot forward output of `{program}`: {source}")]
    Output {
        program: String,
        source: std::io::Error,
    },

    /// A command ran but exited unsuccessfully.
    #[error("`{program}` failed: {message}")]
    CommandFailed { program: String, message: String },

    /// Another process holds the exclusive lock on a file.
    #[error("{path} is locked by another process")]
    LockContention { path: String },

    /// Locking is not available for this file or platform.
    #[error("cannot lock {path}: {source}")]
    Lock {
        path: String,
        source: std::io::Error,
    },
}
