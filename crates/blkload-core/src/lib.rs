//! Asynchronous request lifecycle engine for random-read storage load.
//!
//! Keeps a bounded number of randomly-offset, block-aligned reads in flight
//! against one or more targets (raw block devices or regular files),
//! submitting in batches and reaping completions through a pluggable
//! backend.
//!
//! # Example
//!
//! ```
//! use blkload_core::{
//!     Engine, EngineConfig, RunLimits, ScriptedBackend, StopSignal, TargetRegistry,
//! };
//!
//! let mut registry = TargetRegistry::new();
//! registry.register_detached("mem0", 1 << 20, 4096).unwrap();
//!
//! let config = EngineConfig::default()
//!     .with_block_size(4096)
//!     .with_max_outstanding(16)
//!     .with_limits(RunLimits::completions(64))
//!     .with_seed(1);
//!
//! let mut engine = Engine::new(config, registry, ScriptedBackend::new()).unwrap();
//! let summary = engine.run(&StopSignal::new()).unwrap();
//!
//! assert!(summary.stats.completed >= 64);
//! assert_eq!(engine.outstanding(), 0);
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod backend;
pub mod config;
pub mod engine;
mod error;
pub mod reaper;
pub mod reconcile;
pub mod scripted;
pub mod stats;
pub mod target;
pub mod tracker;
pub mod uring;

pub use backend::{Backend, Completion, CompletionNotifier, ReadRequest, RequestStatus, Submitter};
pub use config::{EngineConfig, RunLimits, MAX_TARGETS};
pub use engine::{aligned_offset, Engine, StopSignal};
pub use error::{Error, Result};
pub use scripted::{ScriptedBackend, ScriptedStatus};
pub use stats::{EngineStats, RunSummary};
pub use target::{Target, TargetId, TargetKind, TargetRegistry};
pub use tracker::{Operation, OpStatus, Token, Tracker, DIRECT_IO_ALIGNMENT};
pub use uring::UringBackend;
