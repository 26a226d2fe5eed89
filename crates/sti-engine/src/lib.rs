//! Container engine capability and its CLI-backed transport.

#![forbid(unsafe_code)]

pub mod client;
pub mod docker;
pub mod error;

pub use client::{Bind, ContainerConfig, EngineClient, ImageInfo};
pub use docker::DockerCli;
pub use error::EngineError;
