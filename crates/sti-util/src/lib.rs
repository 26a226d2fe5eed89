//! Filesystem, process, locking, and source retrieval helpers for sti.

#![forbid(unsafe_code)]

pub mod error;
pub mod fs;
pub mod lock;
pub mod process;
pub mod source;
