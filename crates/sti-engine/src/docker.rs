//! `EngineClient` driving the `docker` command-line client against an
//! explicit endpoint.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use sti_util::process::{run_command_streaming, run_command_with_timeout, CommandOutput};

use crate::client::{ContainerConfig, EngineClient, ImageInfo};
use crate::error::EngineError;

/// Engine transport backed by the engine's CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    endpoint: String,
    timeout: Duration,
}

impl DockerCli {
    /// Connect to the engine at `endpoint`, verifying that it answers.
    ///
    /// # Errors
    /// Returns `EngineError::Connect` if the CLI cannot be run or the daemon
    /// does not respond within `timeout`.
    pub fn connect(binary: &str, endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = Self {
            binary: binary.to_owned(),
            endpoint: endpoint.to_owned(),
            timeout,
        };
        let version = client
            .run("version", &["version", "--format", "{{.Server.Version}}"], None)
            .map_err(|e| EngineError::Connect {
                endpoint: endpoint.to_owned(),
                message: e.to_string(),
            })?;
        debug!(
            endpoint,
            version = %version.stdout_text().trim(),
            "connected to container engine"
        );
        Ok(client)
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-H").arg(&self.endpoint);
        cmd.args(args.iter().map(AsRef::as_ref));
        cmd
    }

    fn run<S: AsRef<str>>(
        &self,
        operation: &str,
        args: &[S],
        stdin: Option<File>,
    ) -> Result<CommandOutput, EngineError> {
        let output = self.run_unchecked(args, stdin)?;
        if !output.success {
            return Err(operation_error(operation, &output));
        }
        Ok(output)
    }

    fn run_unchecked<S: AsRef<str>>(
        &self,
        args: &[S],
        stdin: Option<File>,
    ) -> Result<CommandOutput, EngineError> {
        let mut cmd = self.command(args);
        Ok(run_command_with_timeout(&mut cmd, self.timeout, stdin)?)
    }
}

fn operation_error(operation: &str, output: &CommandOutput) -> EngineError {
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        format!("exit status {}", output.exit_code.unwrap_or(-1))
    } else {
        stderr.to_owned()
    };
    EngineError::Operation {
        operation: operation.to_owned(),
        message,
    }
}

#[derive(Debug, Deserialize)]
struct InspectedImage {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectedConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
}

/// Parse `image inspect` JSON output (an array with one object per image).
pub(crate) fn parse_inspect(json: &str) -> Result<Option<ImageInfo>, EngineError> {
    let images: Vec<InspectedImage> =
        serde_json::from_str(json).map_err(|e| EngineError::Parse {
            operation: "inspect".to_owned(),
            message: e.to_string(),
        })?;
    Ok(images.into_iter().next().map(|image| ImageInfo {
        id: image.id,
        entrypoint: image
            .config
            .and_then(|c| c.entrypoint)
            .filter(|e| !e.is_empty()),
    }))
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such image")
}

/// Extract the one regular file from the tar stream `cp ... -` writes.
pub(crate) fn single_file_contents(path: &str, archive: &[u8]) -> Result<Vec<u8>, EngineError> {
    let parse_error = |message: String| EngineError::Parse {
        operation: "cp".to_owned(),
        message,
    };

    let mut archive = tar::Archive::new(archive);
    let entries = archive.entries().map_err(|e| parse_error(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| parse_error(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| parse_error(e.to_string()))?;
        return Ok(content);
    }
    Err(parse_error(format!("{path} is not a regular file")))
}

/// Build the `create` argument list for a container config.
pub(crate) fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = vec!["create".to_owned()];

    for bind in &config.binds {
        args.push("--volume".to_owned());
        args.push(bind.to_string());
    }

    // Anonymous volumes, unless a bind already covers the path.
    for volume in &config.volumes {
        if !config.binds.iter().any(|b| &b.container == volume) {
            args.push("--volume".to_owned());
            args.push(volume.clone());
        }
    }

    args.push(config.image.clone());
    args.extend(config.command.iter().cloned());
    args
}

impl EngineClient for DockerCli {
    fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>, EngineError> {
        let output = self.run_unchecked(&["image", "inspect", name], None)?;
        if !output.success {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(operation_error("inspect", &output));
        }
        parse_inspect(&output.stdout_text())
    }

    fn pull_image(&self, name: &str) -> Result<(), EngineError> {
        debug!(image = name, "pulling image");
        self.run("pull", &["pull", "--quiet", name], None)
            .map(|_| ())
    }

    fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let args = create_args(config);
        let output = self.run("create", args.as_slice(), None)?;
        let id = output.stdout_text().trim().to_owned();
        if id.is_empty() {
            return Err(EngineError::Parse {
                operation: "create".to_owned(),
                message: "engine returned no container ID".to_owned(),
            });
        }
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.run("start", &["start", id], None).map(|_| ())
    }

    fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let output = self.run("wait", &["wait", id], None)?;
        let text = output.stdout_text();
        text.trim().parse().map_err(|_| EngineError::Parse {
            operation: "wait".to_owned(),
            message: format!("expected an exit code, got \"{}\"", text.trim()),
        })
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id);
        self.run("rm", args.as_slice(), None).map(|_| ())
    }

    fn copy_file_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let source = format!("{id}:{path}");
        let output = self.run("cp", &["cp", "--follow-link", source.as_str(), "-"], None)?;
        single_file_contents(path, &output.stdout)
    }

    fn build_image(
        &self,
        tag: &str,
        context: &Path,
        log: &mut dyn Write,
    ) -> Result<(), EngineError> {
        let archive = File::open(context).map_err(|source| {
            EngineError::Util(sti_util::error::UtilError::Io {
                path: context.display().to_string(),
                source,
            })
        })?;
        let mut cmd = self.command(&["build", "--tag", tag, "-"]);
        let output = run_command_streaming(&mut cmd, self.timeout, Some(archive), log)?;
        if !output.success {
            return Err(operation_error("build", &output));
        }
        Ok(())
    }
}
