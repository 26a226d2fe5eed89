//! Build orchestration: decide clean vs incremental, pick the strategy, and
//! drive detect → extract → stage → render → package → build.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use sti_config::{BuildSpec, EnvVar, Request};
use sti_engine::{DockerCli, EngineClient};
use sti_util::error::UtilError;
use sti_util::fs::{collect_regular_files, create_private_dir, ensure_dir};
use sti_util::source::SourceFetcher;

use crate::artifacts::{detect_incremental, image_exists, save_artifacts};
use crate::context::{
    lock_manifest, package, prepare_source, ManifestGuard, ARTIFACTS_DIR, SOURCE_DIR,
};
use crate::error::{ErrorKind, StiError};

/// Which pipeline produced the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStrategy {
    /// One image built `FROM` the base image.
    Standard,
    /// Built with the base image, then repackaged `FROM` the runtime image.
    Extended,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub success: bool,
    /// Engine output lines; empty when output was streamed to a log sink.
    pub messages: Vec<String>,
    pub strategy: BuildStrategy,
    /// Whether artifacts from a prior image were reused.
    pub incremental: bool,
}

/// Connect to the engine named by `request` using the `binary` CLI.
///
/// # Errors
/// Returns `ErrorKind::EngineConnectionFailed` if the engine does not answer.
pub fn connect(request: &Request, binary: &str) -> Result<DockerCli, StiError> {
    DockerCli::connect(binary, &request.engine_url, request.timeout).map_err(|e| {
        StiError::new(ErrorKind::EngineConnectionFailed, request.engine_url.clone()).with_source(e)
    })
}

/// Build the image described by `spec`.
///
/// With `log` set, engine output is streamed to it and
/// `BuildResult::messages` is empty; otherwise the output is captured into
/// `messages` line by line. The working directory is populated but never
/// removed; that is left to the caller.
///
/// The manifest of every context directory the build uses is locked before
/// anything else happens and stays locked until the build returns, so a
/// second build into the same working directory fails with
/// `ErrorKind::CreateManifestFailed` without touching the first one's files.
///
/// # Errors
/// Fails with the kind of the first step that failed; no step runs after a
/// failure and no partial success is reported.
pub fn build(
    engine: &dyn EngineClient,
    fetcher: &dyn SourceFetcher,
    spec: &BuildSpec,
    log: Option<&mut dyn Write>,
) -> Result<BuildResult, StiError> {
    let contexts = claim_contexts(spec)?;
    let strategy = contexts.strategy();
    let incremental = decide_incremental(engine, spec)?;
    info!(tag = %spec.tag, ?strategy, incremental, "starting build");

    let messages = match log {
        Some(sink) => {
            run_strategy(engine, fetcher, spec, contexts, incremental, sink)?;
            Vec::new()
        }
        None => {
            let mut captured = Vec::new();
            run_strategy(engine, fetcher, spec, contexts, incremental, &mut captured)?;
            String::from_utf8_lossy(&captured)
                .lines()
                .map(str::to_owned)
                .collect()
        }
    };

    info!(tag = %spec.tag, "build complete");
    Ok(BuildResult {
        success: true,
        messages,
        strategy,
        incremental,
    })
}

/// Context directories of one build, each with its manifest locked.
enum Contexts<'a> {
    Standard(ManifestGuard),
    Extended {
        builder: ManifestGuard,
        runtime: ManifestGuard,
        runtime_image: &'a str,
    },
}

impl Contexts<'_> {
    fn strategy(&self) -> BuildStrategy {
        match self {
            Self::Standard(_) => BuildStrategy::Standard,
            Self::Extended { .. } => BuildStrategy::Extended,
        }
    }
}

fn claim_contexts(spec: &BuildSpec) -> Result<Contexts<'_>, StiError> {
    let working_dir = &spec.request.working_dir;
    let Some(runtime_image) = spec.request.runtime_image.as_deref() else {
        return Ok(Contexts::Standard(claim_context(working_dir)?));
    };
    Ok(Contexts::Extended {
        builder: claim_context(&working_dir.join("build"))?,
        runtime: claim_context(&working_dir.join("runtime"))?,
        runtime_image,
    })
}

fn claim_context(dir: &Path) -> Result<ManifestGuard, StiError> {
    ensure_dir(dir).map_err(|e| staging_failed(dir, e))?;
    lock_manifest(dir)
}

/// Decide whether prior artifacts can be reused.
///
/// Downgrades to a clean build when one was requested, when no image exists
/// under the tag yet, or when that image cannot export artifacts.
fn decide_incremental(engine: &dyn EngineClient, spec: &BuildSpec) -> Result<bool, StiError> {
    if spec.clean {
        debug!("clean build will be performed");
        return Ok(false);
    }
    if !image_exists(engine, &spec.tag)? {
        debug!(tag = %spec.tag, "no prior image, clean build will be performed");
        return Ok(false);
    }
    detect_incremental(engine, &spec.tag)
}

fn run_strategy(
    engine: &dyn EngineClient,
    fetcher: &dyn SourceFetcher,
    spec: &BuildSpec,
    contexts: Contexts<'_>,
    incremental: bool,
    log: &mut dyn Write,
) -> Result<(), StiError> {
    let working_dir = &spec.request.working_dir;
    let prior = incremental.then_some(spec.tag.as_str());

    let (builder, runtime, runtime_image) = match contexts {
        Contexts::Standard(manifest) => {
            let stage = Stage {
                context_dir: working_dir.clone(),
                from: &spec.request.base_image,
                tag: &spec.tag,
                prior,
                source: StageSource::Fetch(&spec.source),
            };
            return build_stage(engine, fetcher, &spec.environment, &stage, manifest, log);
        }
        Contexts::Extended {
            builder,
            runtime,
            runtime_image,
        } => (builder, runtime, runtime_image),
    };

    // 1. Build with the base image into an intermediate tag.
    let builder_tag = format!("{}-build", spec.tag);
    let stage = Stage {
        context_dir: working_dir.join("build"),
        from: &spec.request.base_image,
        tag: &builder_tag,
        prior,
        source: StageSource::Fetch(&spec.source),
    };
    build_stage(engine, fetcher, &spec.environment, &stage, builder, log)?;

    // 2. Pull the build output back out of the intermediate image.
    let output_dir = working_dir.join("runtime-src");
    create_private_dir(&output_dir).map_err(|e| staging_failed(&output_dir, e))?;
    save_artifacts(engine, &builder_tag, &output_dir)?;

    // 3. Repackage the output on top of the runtime image.
    let stage = Stage {
        context_dir: working_dir.join("runtime"),
        from: runtime_image,
        tag: &spec.tag,
        prior: None,
        source: StageSource::Local(&output_dir),
    };
    build_stage(engine, fetcher, &spec.environment, &stage, runtime, log)
}

/// One context directory built into one image.
struct Stage<'a> {
    context_dir: PathBuf,
    from: &'a str,
    tag: &'a str,
    /// Image to extract artifacts from, for incremental builds.
    prior: Option<&'a str>,
    source: StageSource<'a>,
}

enum StageSource<'a> {
    /// A path or version-control URL supplied by the user.
    Fetch(&'a str),
    /// A directory produced by an earlier stage.
    Local(&'a Path),
}

fn build_stage(
    engine: &dyn EngineClient,
    fetcher: &dyn SourceFetcher,
    environment: &[EnvVar],
    stage: &Stage<'_>,
    manifest: ManifestGuard,
    log: &mut dyn Write,
) -> Result<(), StiError> {
    let context_dir = &stage.context_dir;

    // Artifacts must be in place before the source is staged.
    let mut with_artifacts = false;
    if let Some(prior) = stage.prior {
        let artifacts_dir = context_dir.join(ARTIFACTS_DIR);
        create_private_dir(&artifacts_dir).map_err(|e| {
            StiError::new(
                ErrorKind::SaveArtifactsFailed,
                format!("creating {}", artifacts_dir.display()),
            )
            .with_source(e)
        })?;
        save_artifacts(engine, prior, &artifacts_dir)?;
        // Only files are archived, so an empty tree must not be referenced.
        with_artifacts = !collect_regular_files(&artifacts_dir)
            .map_err(|e| staging_failed(&artifacts_dir, e))?
            .is_empty();
        if !with_artifacts {
            debug!(image = prior, "save-artifacts produced no output");
        }
    }

    let source_dir = context_dir.join(SOURCE_DIR);
    match stage.source {
        StageSource::Fetch(source) => prepare_source(fetcher, source, &source_dir)?,
        StageSource::Local(dir) => fetcher
            .copy_tree(dir, &source_dir)
            .map_err(|e| staging_failed(&source_dir, e))?,
    }

    manifest.write(stage.from, environment, with_artifacts)?;
    let archive = package(context_dir)?;
    debug!(
        manifest = %manifest.path().display(),
        archive = %archive.path().display(),
        tag = stage.tag,
        "submitting build context"
    );

    engine.build_image(stage.tag, archive.path(), log).map_err(|e| {
        StiError::new(ErrorKind::BuildFailed, format!("building {}", stage.tag)).with_source(e)
    })?;
    // Held until the engine build has returned.
    drop(manifest);
    Ok(())
}

fn staging_failed(path: &Path, source: UtilError) -> StiError {
    StiError::new(ErrorKind::BuildFailed, format!("staging {}", path.display())).with_source(source)
}
