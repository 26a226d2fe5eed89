//! Source-to-image build orchestration: strategy selection, incremental
//! artifact reuse, build context assembly, and image validation.

#![forbid(unsafe_code)]

pub mod artifacts;
pub mod build;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod validate;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod testing;

pub use build::{build, connect, BuildResult, BuildStrategy};
pub use error::{ErrorKind, StiError};
pub use validate::{validate, ImageCheck, ImageRole, ValidationResult};
