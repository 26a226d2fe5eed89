#![forbid(unsafe_code)]

use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tempfile::TempDir;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sti_build::BuildStrategy;
use sti_config::{BuildSpec, EnvParseError, EnvVar, Request, Settings, ValidationSpec};
use sti_util::source::ShellSource;

type CliResult = Result<(), Box<dyn Error>>;

const SETTINGS_FILE: &str = "sti.toml";

#[derive(Debug, Parser)]
#[command(name = "sti", about = "Build runnable container images from application source")]
#[command(version)]
struct Cli {
    /// Container engine endpoint [default: unix:///var/run/docker.sock]
    #[arg(long, global = true)]
    url: Option<String>,
    /// Timeout in seconds for each engine call [default: 30]
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Print step-by-step diagnostics
    #[arg(long, global = true)]
    debug: bool,
    /// Settings file [default: ./sti.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build an image from application source
    Build {
        /// Source directory or version-control URL
        source: String,
        /// Image that prepares the application
        base_image: String,
        /// Tag for the built image
        tag: String,
        /// Ignore artifacts from a previous build of the tag
        #[arg(long)]
        clean: bool,
        /// Directory to assemble the build context in [default: a fresh temp dir]
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Repackage the build output onto this image
        #[arg(long)]
        runtime_image: Option<String>,
        /// Environment entries as NAME=VALUE, comma-separated; may be repeated
        #[arg(short = 'e', long = "env", value_name = "NAME=VALUE,...")]
        env: Vec<String>,
    },
    /// Check that images can be used for builds
    Validate {
        /// Image that prepares the application
        base_image: String,
        /// Runtime image to check as well
        #[arg(short = 'R', long)]
        runtime_image: Option<String>,
        /// Require support for incremental builds
        #[arg(short = 'I', long)]
        incremental: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match &cli.command {
        Command::Build {
            source,
            base_image,
            tag,
            clean,
            dir,
            runtime_image,
            env,
        } => cmd_build(
            &cli,
            BuildArgs {
                source,
                base_image,
                tag,
                clean: *clean,
                dir: dir.as_deref(),
                runtime_image: runtime_image.as_deref(),
                env,
            },
        ),
        Command::Validate {
            base_image,
            runtime_image,
            incremental,
        } => cmd_validate(&cli, base_image, runtime_image.as_deref(), *incremental),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        let mut cause = err.source();
        while let Some(inner) = cause {
            eprintln!("  caused by: {inner}");
            cause = inner.source();
        }
        process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Load `sti.toml` from `--config`, else from the current directory.
///
/// An explicitly named file must exist; the implicit one is optional.
fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn Error>> {
    match &cli.config {
        Some(path) if !path.exists() => {
            Err(format!("settings file {} does not exist", path.display()).into())
        }
        Some(path) => Ok(Settings::from_path(path)?),
        None => Ok(Settings::from_path(Path::new(SETTINGS_FILE))?),
    }
}

/// Parse every `-e` occurrence, keeping command-line order.
fn parse_environment(values: &[String]) -> Result<Vec<EnvVar>, EnvParseError> {
    let mut environment = Vec::new();
    for value in values {
        environment.extend(EnvVar::parse_list(value)?);
    }
    Ok(environment)
}

/// Assemble the request; command-line flags override the settings file.
fn request(
    cli: &Cli,
    settings: &Settings,
    base_image: &str,
    runtime_image: Option<&str>,
    working_dir: PathBuf,
) -> Request {
    let timeout = cli
        .timeout
        .map_or_else(|| settings.timeout(), std::time::Duration::from_secs);
    Request {
        engine_url: cli.url.clone().unwrap_or_else(|| settings.engine.url.clone()),
        timeout,
        working_dir,
        debug: cli.debug,
        base_image: base_image.to_owned(),
        runtime_image: runtime_image.map(str::to_owned),
    }
}

/// Where a build context is assembled.
enum WorkingDir {
    Fixed(PathBuf),
    /// Removed when dropped, after the build has finished.
    Temporary(TempDir),
}

impl WorkingDir {
    fn new(configured: Option<PathBuf>) -> io::Result<Self> {
        match configured {
            Some(dir) => Ok(Self::Fixed(dir)),
            None => Ok(Self::Temporary(
                tempfile::Builder::new().prefix("sti-").tempdir()?,
            )),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Fixed(dir) => dir,
            Self::Temporary(temp) => temp.path(),
        }
    }
}

#[derive(Clone, Copy)]
struct BuildArgs<'a> {
    source: &'a str,
    base_image: &'a str,
    tag: &'a str,
    clean: bool,
    dir: Option<&'a Path>,
    runtime_image: Option<&'a str>,
    env: &'a [String],
}

fn cmd_build(cli: &Cli, args: BuildArgs<'_>) -> CliResult {
    let settings = load_settings(cli)?;
    let environment = parse_environment(args.env)?;

    let configured = args
        .dir
        .map(Path::to_path_buf)
        .or_else(|| settings.build.working_dir.clone());
    let working_dir = WorkingDir::new(configured)?;
    debug!(working_dir = %working_dir.path().display(), "using working directory");

    let spec = BuildSpec {
        request: request(
            cli,
            &settings,
            args.base_image,
            args.runtime_image,
            working_dir.path().to_path_buf(),
        ),
        source: args.source.to_owned(),
        tag: args.tag.to_owned(),
        clean: args.clean,
        environment,
    };

    let engine = sti_build::connect(&spec.request, &settings.engine.binary)?;
    let mut stdout = io::stdout();
    let result = sti_build::build(&engine, &ShellSource, &spec, Some(&mut stdout))?;

    let strategy = match result.strategy {
        BuildStrategy::Standard => "standard",
        BuildStrategy::Extended => "extended",
    };
    let mode = if result.incremental { "incremental" } else { "clean" };
    eprintln!("    Built {} ({strategy}, {mode})", spec.tag);
    Ok(())
}

fn cmd_validate(
    cli: &Cli,
    base_image: &str,
    runtime_image: Option<&str>,
    incremental: bool,
) -> CliResult {
    let settings = load_settings(cli)?;
    let spec = ValidationSpec {
        request: request(cli, &settings, base_image, runtime_image, std::env::temp_dir()),
        incremental,
    };

    let engine = sti_build::connect(&spec.request, &settings.engine.binary)?;
    let result = sti_build::validate(&engine, &spec)?;
    for message in result.messages() {
        println!("{message}");
    }

    if result.is_valid() {
        Ok(())
    } else {
        Err(validation_failed())
    }
}

fn validation_failed() -> Box<dyn Error> {
    "one or more images failed validation".into()
}
