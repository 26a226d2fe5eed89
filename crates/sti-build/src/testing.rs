//! In-memory engine and source fakes that record every call in order.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use sti_config::Request;
use sti_engine::{Bind, ContainerConfig, EngineClient, EngineError, ImageInfo};
use sti_util::error::UtilError;
use sti_util::source::{ShellSource, SourceFetcher};

use crate::artifacts::SAVE_ARTIFACTS;
use crate::context::{MANIFEST_NAME, SOURCE_DIR};
use crate::validate::{PREPARE, RUN};

pub(crate) fn request(base_image: &str, working_dir: &Path) -> Request {
    Request {
        engine_url: "unix:///var/run/docker.sock".to_owned(),
        timeout: Duration::from_secs(30),
        working_dir: working_dir.to_path_buf(),
        debug: false,
        base_image: base_image.to_owned(),
        runtime_image: None,
    }
}

/// Ordered call log shared by the fakes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Events(Rc<RefCell<Vec<String>>>);

impl Events {
    pub(crate) fn push(&self, event: String) {
        self.0.borrow_mut().push(event);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub(crate) fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeImage {
    pub entrypoint: bool,
    /// Files visible inside containers, by absolute path.
    pub files: BTreeMap<String, Vec<u8>>,
    pub save_artifacts_exit: i64,
    /// What `save-artifacts` writes, relative to the artifacts mount.
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl FakeImage {
    /// Carries `prepare` and `run`.
    pub(crate) fn compliant() -> Self {
        let mut image = Self::default();
        image.files.insert(PREPARE.to_owned(), b"#!/bin/sh\n".to_vec());
        image.files.insert(RUN.to_owned(), b"#!/bin/sh\n".to_vec());
        image
    }

    /// Also carries `save-artifacts`.
    pub(crate) fn incremental() -> Self {
        let mut image = Self::compliant();
        image.files.insert(SAVE_ARTIFACTS.to_owned(), b"#!/bin/sh\n".to_vec());
        image
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    image: String,
    command: Vec<String>,
    binds: Vec<Bind>,
}

/// A build the fake engine accepted.
#[derive(Debug, Clone)]
pub(crate) struct RecordedBuild {
    pub tag: String,
    pub manifest: String,
    /// Archive entry names, sorted.
    pub entries: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    local: RefCell<BTreeMap<String, FakeImage>>,
    remote: RefCell<BTreeMap<String, FakeImage>>,
    containers: RefCell<BTreeMap<String, FakeContainer>>,
    next_id: Cell<u32>,
    events: Events,
    builds: RefCell<Vec<RecordedBuild>>,
    pub fail_create: Cell<bool>,
    pub fail_start: Cell<bool>,
    pub fail_remove: Cell<bool>,
    pub fail_build: Cell<bool>,
    /// Pulls report success without making the image available.
    pub pull_is_noop: Cell<bool>,
}

fn fake_error(operation: &str, message: impl Into<String>) -> EngineError {
    EngineError::Operation {
        operation: operation.to_owned(),
        message: message.into(),
    }
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_image(self, name: &str, image: FakeImage) -> Self {
        self.local.borrow_mut().insert(name.to_owned(), image);
        self
    }

    pub(crate) fn with_remote_image(self, name: &str, image: FakeImage) -> Self {
        self.remote.borrow_mut().insert(name.to_owned(), image);
        self
    }

    pub(crate) fn event_log(&self) -> Events {
        self.events.clone()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.snapshot()
    }

    pub(crate) fn live_containers(&self) -> usize {
        self.containers.borrow().len()
    }

    pub(crate) fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.borrow().clone()
    }

    pub(crate) fn image(&self, name: &str) -> Option<FakeImage> {
        self.local.borrow().get(name).cloned()
    }

    fn container(&self, id: &str) -> Result<FakeContainer, EngineError> {
        self.containers
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| fake_error("container", format!("no such container: {id}")))
    }

    fn container_image(&self, id: &str) -> Result<FakeImage, EngineError> {
        let container = self.container(id)?;
        self.image(&container.image)
            .ok_or_else(|| fake_error("container", format!("no such image: {}", container.image)))
    }

    fn runs_save_artifacts(container: &FakeContainer) -> bool {
        container.command.first().map(String::as_str) == Some(SAVE_ARTIFACTS)
    }
}

impl EngineClient for FakeEngine {
    fn inspect_image(&self, name: &str) -> Result<Option<ImageInfo>, EngineError> {
        self.events.push(format!("inspect {name}"));
        Ok(self.image(name).map(|image| ImageInfo {
            id: format!("sha256:{name}"),
            entrypoint: image.entrypoint.then(|| vec!["/entrypoint.sh".to_owned()]),
        }))
    }

    fn pull_image(&self, name: &str) -> Result<(), EngineError> {
        self.events.push(format!("pull {name}"));
        let image = self
            .remote
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| fake_error("pull", format!("repository {name} not found")))?;
        if !self.pull_is_noop.get() {
            self.local.borrow_mut().insert(name.to_owned(), image);
        }
        Ok(())
    }

    fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let mut event = vec!["create".to_owned(), config.image.clone()];
        event.extend(config.command.iter().cloned());
        for bind in &config.binds {
            event.push("--volume".to_owned());
            event.push(bind.to_string());
        }
        self.events.push(event.join(" "));

        if self.fail_create.get() {
            return Err(fake_error("create", "engine refused"));
        }
        if self.image(&config.image).is_none() {
            return Err(fake_error("create", format!("no such image: {}", config.image)));
        }
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        let id = format!("c{n}");
        self.containers.borrow_mut().insert(
            id.clone(),
            FakeContainer {
                image: config.image.clone(),
                command: config.command.clone(),
                binds: config.binds.clone(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.events.push(format!("start {id}"));
        if self.fail_start.get() {
            return Err(fake_error("start", "cannot start"));
        }
        let container = self.container(id)?;
        if !Self::runs_save_artifacts(&container) {
            return Ok(());
        }

        let image = self.container_image(id)?;
        if !image.files.contains_key(SAVE_ARTIFACTS) {
            return Err(fake_error("start", "exec: /usr/bin/save-artifacts: not found"));
        }
        for bind in &container.binds {
            for (relative, content) in &image.artifacts {
                let path = bind.host.join(relative);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| fake_error("start", e.to_string()))?;
                }
                fs::write(&path, content).map_err(|e| fake_error("start", e.to_string()))?;
            }
        }
        Ok(())
    }

    fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        self.events.push(format!("wait {id}"));
        let container = self.container(id)?;
        if Self::runs_save_artifacts(&container) {
            return Ok(self.container_image(id)?.save_artifacts_exit);
        }
        Ok(0)
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.events.push(format!("remove {id}"));
        if self.fail_remove.get() || !force {
            return Err(fake_error("rm", "cannot remove"));
        }
        self.containers.borrow_mut().remove(id);
        Ok(())
    }

    fn copy_file_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        self.events.push(format!("copy {id} {path}"));
        self.container_image(id)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| fake_error("cp", format!("no such file: {path}")))
    }

    fn build_image(&self, tag: &str, context: &Path, log: &mut dyn Write) -> Result<(), EngineError> {
        self.events.push(format!("build {tag}"));

        let file = File::open(context).map_err(|e| fake_error("build", e.to_string()))?;
        let mut archive = tar::Archive::new(file);
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for entry in archive.entries().map_err(|e| fake_error("build", e.to_string()))? {
            let mut entry = entry.map_err(|e| fake_error("build", e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| fake_error("build", e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| fake_error("build", e.to_string()))?;
            entries.insert(name, content);
        }

        let manifest = entries
            .get(MANIFEST_NAME)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        let from = manifest
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("FROM "))
            .unwrap_or_default()
            .to_owned();
        writeln!(log, "Step 1 : FROM {from}").map_err(|e| fake_error("build", e.to_string()))?;

        if self.fail_build.get() {
            writeln!(log, "/usr/bin/prepare exited with 1").map_err(|e| fake_error("build", e.to_string()))?;
            return Err(fake_error("build", "the command '/bin/sh -c /usr/bin/prepare' returned a non-zero code: 1"));
        }
        let mut image = self
            .image(&from)
            .ok_or_else(|| fake_error("build", format!("no such image: {from}")))?;

        // The prepared application is what save-artifacts hands back later.
        let prefix = format!("{SOURCE_DIR}/");
        image.artifacts = entries
            .iter()
            .filter_map(|(name, content)| {
                name.strip_prefix(&prefix)
                    .map(|rel| (rel.to_owned(), content.clone()))
            })
            .collect();
        self.local.borrow_mut().insert(tag.to_owned(), image);
        writeln!(log, "Successfully built {tag}").map_err(|e| fake_error("build", e.to_string()))?;

        self.builds.borrow_mut().push(RecordedBuild {
            tag: tag.to_owned(),
            manifest,
            entries: entries.into_keys().collect(),
        });
        Ok(())
    }
}

/// Source fetcher that fakes clones and copies real trees.
pub(crate) struct FakeSource {
    events: Events,
    pub fail_clone: Cell<bool>,
    /// Runs once, in the middle of the next clone.
    pub during_clone: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl FakeSource {
    pub(crate) fn new(events: Events) -> Self {
        Self {
            events,
            fail_clone: Cell::new(false),
            during_clone: RefCell::new(None),
        }
    }
}

impl SourceFetcher for FakeSource {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), UtilError> {
        self.events.push(format!("clone {url}"));
        if self.fail_clone.get() {
            return Err(UtilError::CommandFailed {
                program: "git clone".to_owned(),
                message: "repository not found".to_owned(),
            });
        }
        let io = |source| UtilError::Io {
            path: dest.display().to_string(),
            source,
        };
        fs::create_dir_all(dest).map_err(io)?;
        let hook = self.during_clone.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        fs::write(dest.join("index.html"), b"<html>hello</html>").map_err(io)
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), UtilError> {
        self.events.push(format!("copy-tree {}", src.display()));
        ShellSource.copy_tree(src, dest)
    }
}

