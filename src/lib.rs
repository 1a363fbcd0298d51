//! # blkload
//!
//! Random-read storage load generator built on asynchronous block I/O.
//!
//! This is the workspace root crate that re-exports the engine.
//! For direct usage, depend on the sub-crates:
//!
//! - [`blkload-core`] - Request lifecycle engine, target registry, backends
//! - [`blkload-cli`] - CLI tool (`blkload` binary)

pub use blkload_core::*;
