use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENGINE_URL: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ENGINE_BINARY: &str = "docker";

/// The optional `sti.toml` settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub build: BuildSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub url: String,
    /// Per-call timeout in seconds.
    pub timeout: u64,
    /// Docker-compatible CLI used by the transport, by name or path.
    pub binary: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENGINE_URL.to_owned(),
            timeout: DEFAULT_TIMEOUT_SECS,
            binary: DEFAULT_ENGINE_BINARY.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    /// Fixed working directory; `None` means a fresh temp dir per build.
    pub working_dir: Option<PathBuf>,
}

impl Settings {
    /// Read and parse `sti.toml` from the given path.
    /// Returns default settings if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or contains invalid TOML.
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| SettingsError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Parse settings from TOML text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid settings TOML.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The per-call engine timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid sti.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}
