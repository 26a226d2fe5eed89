//! The engine capability consumed by the build pipeline.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// The parts of an image's configuration the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Engine-assigned image ID.
    pub id: String,
    /// Configured entry point, `None` when the image declares none.
    pub entrypoint: Option<Vec<String>>,
}

impl ImageInfo {
    pub fn has_entrypoint(&self) -> bool {
        self.entrypoint.is_some()
    }
}

/// A host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// Absolute path on the engine host.
    pub host: PathBuf,
    /// Mount point inside the container.
    pub container: String,
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container)
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    /// Command overriding the image default; empty keeps the default.
    pub command: Vec<String>,
    /// Container paths declared as volumes.
    pub volumes: Vec<String>,
    pub binds: Vec<Bind>,
}

impl ContainerConfig {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_owned(),
            ..Self::default()
        }
    }

    pub fn command(mut self, command: &[&str]) -> Self {
        self.command = command.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Bind `host` at `container`, declaring `container` as a volume too.
    pub fn bind(mut self, host: &Path, container: &str) -> Self {
        self.volumes.push(container.to_owned());
        self.binds.push(Bind {
            host: host.to_path_buf(),
            container: container.to_owned(),
        });
        self
    }
}

/// Operations the pipeline needs from a container engine.
///
/// Every call blocks until the engine answers or the transport's timeout
/// expires.
pub trait EngineClient {
    /// Look up an image in the local registry. `Ok(None)` means not present.
    ///
    /// # Errors
    /// Returns an error if the engine cannot answer.
    fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>, EngineError>;

    /// Pull an image into the local registry.
    ///
    /// # Errors
    /// Returns an error if the pull fails.
    fn pull_image(&self, name: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container, returning its ID.
    ///
    /// # Errors
    /// Returns an error if the engine refuses to create the container.
    fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError>;

    /// Start a created container.
    ///
    /// # Errors
    /// Returns an error if the container cannot be started.
    fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Block until the container exits and return its exit code.
    ///
    /// # Errors
    /// Returns an error if waiting fails or times out.
    fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Remove a container; `force` also kills it if still running.
    ///
    /// # Errors
    /// Returns an error if the container cannot be removed.
    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Read a file out of a (possibly stopped) container.
    ///
    /// # Errors
    /// Returns an error if the path does not exist or cannot be copied.
    fn copy_file_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError>;

    /// Build and tag an image from a context archive, writing engine output to `log`.
    ///
    /// # Errors
    /// Returns an error if the build fails; output produced so far has
    /// still been written to `log`.
    fn build_image(&self, tag: &str, context: &Path, log: &mut dyn Write)
        -> Result<(), EngineError>;
}
