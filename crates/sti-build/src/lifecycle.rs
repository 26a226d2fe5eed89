//! Ephemeral helper containers: create, run to completion, always remove.

use std::fmt;

use tracing::{debug, warn};

use sti_engine::{ContainerConfig, EngineClient};

use crate::error::{ErrorKind, StiError};

/// Command used when a container only needs to exist long enough to be probed.
pub const PROBE_COMMAND: &[&str] = &["/bin/true"];

/// A helper container that has run to completion.
///
/// The container is force-removed when this value is dropped, whichever way
/// the caller leaves the scope. A failed removal is logged, never raised.
pub struct HelperContainer<'e> {
    engine: &'e dyn EngineClient,
    id: String,
    exit_code: i64,
}

impl HelperContainer<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    /// Return `true` if `path` exists in the container's filesystem.
    ///
    /// A file counts as present only if copying it out succeeds and yields
    /// non-empty content.
    pub fn file_exists(&self, path: &str) -> bool {
        match self.engine.copy_file_from_container(&self.id, path) {
            Ok(content) => {
                let present = !content.is_empty();
                debug!(container = %self.id, path, present, "probed file");
                present
            }
            Err(e) => {
                debug!(container = %self.id, path, error = %e, "file not present");
                false
            }
        }
    }
}

impl fmt::Debug for HelperContainer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperContainer")
            .field("id", &self.id)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl Drop for HelperContainer<'_> {
    fn drop(&mut self) {
        match self.engine.remove_container(&self.id, true) {
            Ok(()) => debug!(container = %self.id, "removed helper container"),
            Err(e) => warn!(container = %self.id, error = %e, "cannot remove helper container"),
        }
    }
}

/// Create a container from `config`, start it and wait for it to exit.
///
/// The returned guard owns the container. If start or wait fails, the
/// container is removed before the error is returned.
///
/// # Errors
/// Returns `ErrorKind::CreateContainerFailed` if the container cannot be
/// created, started or waited on.
pub fn run_ephemeral<'e>(
    engine: &'e dyn EngineClient,
    config: &ContainerConfig,
) -> Result<HelperContainer<'e>, StiError> {
    let failed = |step: &str| {
        StiError::new(
            ErrorKind::CreateContainerFailed,
            format!("{step} container from {}", config.image),
        )
    };

    let id = engine
        .create_container(config)
        .map_err(|e| failed("create").with_source(e))?;
    debug!(container = %id, image = %config.image, command = ?config.command, "created helper container");

    // From here on the guard removes the container on every path.
    let mut container = HelperContainer {
        engine,
        id,
        exit_code: -1,
    };
    engine
        .start_container(&container.id)
        .map_err(|e| failed("start").with_source(e))?;
    container.exit_code = engine
        .wait_container(&container.id)
        .map_err(|e| failed("wait for").with_source(e))?;
    debug!(container = %container.id, exit_code = container.exit_code, "helper container exited");

    Ok(container)
}
