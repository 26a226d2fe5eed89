//! Image contract validation: pull if needed, reject entry points, and
//! probe a disposable container for the required scripts.

use std::fmt;

use tracing::{debug, info, warn};

use sti_config::ValidationSpec;
use sti_engine::{ContainerConfig, EngineClient, ImageInfo};

use crate::artifacts::SAVE_ARTIFACTS;
use crate::error::{ErrorKind, StiError};
use crate::lifecycle::{run_ephemeral, PROBE_COMMAND};

/// Script that prepares the application inside the image.
pub const PREPARE: &str = "/usr/bin/prepare";
/// Script that runs the prepared application.
pub const RUN: &str = "/usr/bin/run";

/// The part an image plays in a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Base,
    Runtime,
}

impl ImageRole {
    fn missing_kind(self) -> ErrorKind {
        match self {
            Self::Base => ErrorKind::NoSuchBaseImage,
            Self::Runtime => ErrorKind::NoSuchRuntimeImage,
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => f.write_str("Base image"),
            Self::Runtime => f.write_str("Runtime image"),
        }
    }
}

/// Outcome of checking one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCheck {
    pub role: ImageRole,
    pub image: String,
    pub passed: bool,
}

/// Overall validation outcome.
///
/// `is_valid()` is the AND of every recorded check, and there is exactly
/// one message per check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationResult {
    checks: Vec<ImageCheck>,
    messages: Vec<String>,
}

impl ValidationResult {
    fn record(&mut self, role: ImageRole, image: &str, verdict: &Verdict) {
        let message = match verdict {
            Verdict::Pass => format!("{role} {image} passes validation"),
            Verdict::EntryPoint => format!(
                "{role} {image} failed validation: configured entrypoint is incompatible with sti"
            ),
            Verdict::Missing(paths) => format!(
                "{role} {image} failed validation: missing {}",
                paths.join(", ")
            ),
        };
        self.checks.push(ImageCheck {
            role,
            image: image.to_owned(),
            passed: matches!(verdict, Verdict::Pass),
        });
        self.messages.push(message);
    }

    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn checks(&self) -> &[ImageCheck] {
        &self.checks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Pass,
    EntryPoint,
    Missing(Vec<&'static str>),
}

/// Scripts an image must contain.
pub fn required_files(incremental: bool) -> Vec<&'static str> {
    let mut files = vec![PREPARE, RUN];
    if incremental {
        files.push(SAVE_ARTIFACTS);
    }
    files
}

/// Validate the configured images.
///
/// Without a runtime image the base image is checked, requiring
/// `save-artifacts` when `spec.incremental` is set. With a runtime image the
/// base image is checked for the build scripts only and the runtime image
/// must also carry `save-artifacts`, since later incremental builds extract
/// from images built on it.
///
/// # Errors
/// Returns `ErrorKind::PullImageFailed` if an image cannot be found or
/// pulled, `ErrorKind::NoSuchBaseImage`/`NoSuchRuntimeImage` if it is still
/// missing after a pull, and `ErrorKind::CreateContainerFailed` if the probe
/// container cannot be run. Any error aborts the whole validation.
pub fn validate(engine: &dyn EngineClient, spec: &ValidationSpec) -> Result<ValidationResult, StiError> {
    let request = &spec.request;
    let mut result = ValidationResult::default();

    match &request.runtime_image {
        Some(runtime) => {
            let verdict = validate_image(engine, &request.base_image, ImageRole::Base, false)?;
            result.record(ImageRole::Base, &request.base_image, &verdict);
            let verdict = validate_image(engine, runtime, ImageRole::Runtime, true)?;
            result.record(ImageRole::Runtime, runtime, &verdict);
        }
        None => {
            let verdict = validate_image(engine, &request.base_image, ImageRole::Base, spec.incremental)?;
            result.record(ImageRole::Base, &request.base_image, &verdict);
        }
    }

    Ok(result)
}

/// Inspect `image` locally, pulling it if absent.
///
/// # Errors
/// Returns `ErrorKind::PullImageFailed` if inspection or the pull fails, and
/// the role's missing-image kind if the pull succeeded but the image is
/// still not present.
pub fn check_and_pull(engine: &dyn EngineClient, image: &str, role: ImageRole) -> Result<ImageInfo, StiError> {
    let pull_failed = || StiError::new(ErrorKind::PullImageFailed, image.to_owned());

    if let Some(info) = engine.inspect_image(image).map_err(|e| pull_failed().with_source(e))? {
        debug!(image, "image available locally");
        return Ok(info);
    }

    info!(image, "pulling image");
    engine.pull_image(image).map_err(|e| pull_failed().with_source(e))?;
    engine
        .inspect_image(image)
        .map_err(|e| pull_failed().with_source(e))?
        .ok_or_else(|| StiError::new(role.missing_kind(), format!("{image} not present after pull")))
}

fn validate_image(
    engine: &dyn EngineClient,
    image: &str,
    role: ImageRole,
    incremental: bool,
) -> Result<Verdict, StiError> {
    debug!(image, %role, incremental, "validating image");
    let info = check_and_pull(engine, image, role)?;

    if info.has_entrypoint() {
        warn!(image, "image has a configured entrypoint and is incompatible with sti");
        return Ok(Verdict::EntryPoint);
    }

    let probe = run_ephemeral(engine, &ContainerConfig::new(image).command(PROBE_COMMAND))?;
    if probe.exit_code() != 0 {
        debug!(image, exit_code = probe.exit_code(), "probe command exited non-zero");
    }

    let missing: Vec<&'static str> = required_files(incremental)
        .into_iter()
        .filter(|path| {
            let present = probe.file_exists(path);
            if present {
                debug!(image, path, "image contains required file");
            } else {
                warn!(image, path, "image is missing required file");
            }
            !present
        })
        .collect();

    if missing.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Missing(missing))
    }
}
