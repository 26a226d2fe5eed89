//! Incremental artifact manager: detect whether a prior image can hand its
//! build artifacts to the next build, and extract them.

use std::path::Path;

use tracing::{debug, info};

use sti_engine::{ContainerConfig, EngineClient};
use sti_util::fs::absolute;

use crate::error::{ErrorKind, StiError};
use crate::lifecycle::{run_ephemeral, PROBE_COMMAND};

/// Script an image ships to export its build artifacts.
pub const SAVE_ARTIFACTS: &str = "/usr/bin/save-artifacts";

/// Where `save-artifacts` writes inside the container, and where the next
/// build finds them.
pub const ARTIFACTS_MOUNT: &str = "/usr/artifacts";

/// Return `true` if an image is present in the engine's local registry.
///
/// # Errors
/// Returns `ErrorKind::BuildFailed` if the engine cannot be queried.
pub fn image_exists(engine: &dyn EngineClient, name: &str) -> Result<bool, StiError> {
    let found = engine.inspect_image(name).map_err(|e| {
        StiError::new(ErrorKind::BuildFailed, format!("looking up image {name}")).with_source(e)
    })?;
    Ok(found.is_some())
}

/// Return `true` if the image tagged `tag` can export artifacts, i.e. it
/// contains `/usr/bin/save-artifacts`.
///
/// The probe container is removed before returning, on success and failure.
///
/// # Errors
/// Returns `ErrorKind::CreateContainerFailed` if the probe container cannot
/// be run.
pub fn detect_incremental(engine: &dyn EngineClient, tag: &str) -> Result<bool, StiError> {
    let probe = run_ephemeral(engine, &ContainerConfig::new(tag).command(PROBE_COMMAND))?;
    let capable = probe.file_exists(SAVE_ARTIFACTS);
    if capable {
        info!(image = tag, "prior image supports incremental builds");
    } else {
        info!(image = tag, "prior image has no save-artifacts, performing clean build");
    }
    Ok(capable)
}

/// Run `save-artifacts` in a container from `image` with `dest_dir`
/// bind-mounted at `/usr/artifacts`.
///
/// Extraction is not retried.
///
/// # Errors
/// Returns `ErrorKind::SaveArtifactsFailed` if the container cannot run or
/// the script exits non-zero.
pub fn save_artifacts(engine: &dyn EngineClient, image: &str, dest_dir: &Path) -> Result<(), StiError> {
    let failed = || {
        StiError::new(
            ErrorKind::SaveArtifactsFailed,
            format!("extracting artifacts from {image} into {}", dest_dir.display()),
        )
    };

    let host_dir = absolute(dest_dir).map_err(|e| failed().with_source(e))?;
    let config = ContainerConfig::new(image)
        .command(&[SAVE_ARTIFACTS])
        .bind(&host_dir, ARTIFACTS_MOUNT);
    debug!(image, dest = %host_dir.display(), "saving artifacts");

    let container = run_ephemeral(engine, &config).map_err(|e| failed().with_source(e))?;
    if container.exit_code() != 0 {
        return Err(StiError::new(
            ErrorKind::SaveArtifactsFailed,
            format!("{SAVE_ARTIFACTS} in {image} exited with status {}", container.exit_code()),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::{FakeEngine, FakeImage};

    #[test]
    fn detects_save_artifacts() {
        let engine = FakeEngine::new().with_image("t1", FakeImage::incremental());
        assert!(detect_incremental(&engine, "t1").unwrap());
        assert_eq!(engine.live_containers(), 0);
    }

    #[test]
    fn missing_save_artifacts_never_extracts() {
        let engine = FakeEngine::new().with_image("t1", FakeImage::compliant());
        assert!(!detect_incremental(&engine, "t1").unwrap());
        assert_eq!(engine.live_containers(), 0);

        let events = engine.events();
        assert!(events.iter().any(|e| e == "create t1 /bin/true"));
        assert!(!events
            .iter()
            .any(|e| e.starts_with("create ") && e.contains(SAVE_ARTIFACTS)));
        assert!(!events.iter().any(|e| e.contains(ARTIFACTS_MOUNT)));
    }

    #[test]
    fn detection_failure_is_create_container_failed() {
        let engine = FakeEngine::new().with_image("t1", FakeImage::incremental());
        engine.fail_start.set(true);
        let err = detect_incremental(&engine, "t1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CreateContainerFailed);
        assert_eq!(engine.live_containers(), 0);
    }

    #[test]
    fn image_lookup() {
        let engine = FakeEngine::new().with_image("t1", FakeImage::compliant());
        assert!(image_exists(&engine, "t1").unwrap());
        assert!(!image_exists(&engine, "t2").unwrap());
    }

    #[test]
    fn extraction_writes_into_bound_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = FakeImage::incremental();
        image.artifacts.insert("deps/lib.jar".to_owned(), b"jar".to_vec());
        let engine = FakeEngine::new().with_image("t1", image);

        save_artifacts(&engine, "t1", tmp.path()).unwrap();

        assert_eq!(fs::read(tmp.path().join("deps/lib.jar")).unwrap(), b"jar");
        assert_eq!(engine.live_containers(), 0);
        let bind = format!("{}:{ARTIFACTS_MOUNT}", absolute(tmp.path()).unwrap().display());
        assert!(engine.events().iter().any(|e| e.contains(&bind)));
    }

    #[test]
    fn non_zero_exit_fails_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = FakeImage::incremental();
        image.save_artifacts_exit = 2;
        let engine = FakeEngine::new().with_image("t1", image);

        let err = save_artifacts(&engine, "t1", tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SaveArtifactsFailed);
        assert!(err.to_string().contains("status 2"), "error was: {err}");
        assert_eq!(engine.live_containers(), 0);
    }

    #[test]
    fn missing_script_fails_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new().with_image("t1", FakeImage::compliant());
        let err = save_artifacts(&engine, "t1", tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SaveArtifactsFailed);
    }
}
