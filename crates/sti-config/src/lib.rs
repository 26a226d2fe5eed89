//! Request value objects and the `sti.toml` settings file.

#![forbid(unsafe_code)]

pub mod request;
pub mod settings;

pub use request::{BuildSpec, EnvParseError, EnvVar, Request, ValidationSpec};
pub use settings::{Settings, SettingsError};
