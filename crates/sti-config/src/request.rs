//! Immutable per-invocation requests.
//!
//! A request is assembled once by the caller and handed to the build or
//! validate pipeline by reference. Nothing downstream mutates it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every operation against the container engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Engine endpoint, e.g. `unix:///var/run/docker.sock`.
    pub engine_url: String,
    /// Upper bound for each individual engine call.
    pub timeout: Duration,
    /// Directory the build context is assembled in.
    pub working_dir: PathBuf,
    /// Emit step-by-step diagnostics.
    ///
    /// Only the front end reads this, to pick the `tracing` level; the
    /// pipelines emit their `debug!` events either way.
    pub debug: bool,
    /// Builder image (or the only image for a standard build).
    pub base_image: String,
    /// Optional runtime image for an extended build.
    pub runtime_image: Option<String>,
}

/// A single `ENV` entry rendered into the build manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    /// Parse a comma-separated list of `NAME=VALUE` pairs.
    ///
    /// Only the first `=` separates name from value, so values may contain
    /// `=`. Empty segments (e.g. a trailing comma) are ignored.
    ///
    /// # Errors
    /// Returns `EnvParseError` for a segment without `=` or with an empty name.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, EnvParseError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let Some((name, value)) = pair.split_once('=') else {
                    return Err(EnvParseError {
                        pair: pair.to_owned(),
                        reason: "expected NAME=VALUE",
                    });
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(EnvParseError {
                        pair: pair.to_owned(),
                        reason: "name is empty",
                    });
                }
                Ok(Self::new(name, value))
            })
            .collect()
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// A malformed environment entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid environment entry \"{pair}\": {reason}")]
pub struct EnvParseError {
    pub pair: String,
    pub reason: &'static str,
}

/// Everything needed to build one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub request: Request,
    /// Filesystem path or version-control URL of the application source.
    pub source: String,
    /// Tag of the image to produce; a prior image under this tag may feed an
    /// incremental build.
    pub tag: String,
    /// Ignore any prior build artifacts.
    pub clean: bool,
    /// Environment entries, rendered in order.
    pub environment: Vec<EnvVar>,
}

/// Everything needed to validate the configured images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSpec {
    pub request: Request,
    /// Require the base image to support incremental builds.
    pub incremental: bool,
}
