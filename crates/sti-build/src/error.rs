//! The failure taxonomy shared by build and validate.

use std::error::Error;

/// Every way a build or validation can fail.
///
/// The set is closed: callers branch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("cannot connect to the container engine")]
    EngineConnectionFailed,

    #[error("base image does not exist")]
    NoSuchBaseImage,

    #[error("runtime image does not exist")]
    NoSuchRuntimeImage,

    #[error("cannot pull image")]
    PullImageFailed,

    #[error("save-artifacts did not complete successfully")]
    SaveArtifactsFailed,

    #[error("cannot create the build manifest")]
    CreateManifestFailed,

    #[error("helper container did not run to completion")]
    CreateContainerFailed,

    #[error("image build failed")]
    BuildFailed,
}

/// A failure kind plus the details of the operation that hit it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct StiError {
    kind: ErrorKind,
    context: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl StiError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            source: None,
        }
    }

    /// Attach the lower-level error that caused this failure.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}
