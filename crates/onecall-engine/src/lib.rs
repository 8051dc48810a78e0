#![warn(missing_docs)]

//! # onecall-engine
//!
//! Turns one submitted JavaScript command into one result.
//!
//! The [`CommandProcessor`] strips markdown fences, expands aliases and
//! snippets, runs the [`Validator`], resolves `namespace.function(...)`
//! references against a registry snapshot and executes the rewritten code
//! in a fresh V8 isolate. Capability calls are dispatched either in process
//! or to a persistent per-module worker managed by the [`WorkerPool`].
//!
//! ## Boundaries
//!
//! - Failures cross the V8 boundary as tagged JSON envelopes, never as
//!   native exceptions.
//! - Workers speak newline-delimited JSON over stdin/stdout (see [`ipc`]).
//! - In-process capabilities are guarded only by validation, which is a
//!   gate against careless code, not a sandbox.

pub mod dispatch;
pub mod error;
pub mod executor;
pub mod expand;
pub mod fence;
pub mod ipc;
pub mod launcher;
pub mod ops;
pub mod pool;
pub mod processor;
pub mod resolve;
pub mod syntax;
pub mod validator;
pub mod wrap;

pub use dispatch::Dispatcher;
pub use error::EngineError;
pub use executor::{Executor, ExecutorConfig, Outcome};
pub use expand::Snippet;
pub use launcher::{CommandLauncher, WorkerLauncher, DEFAULT_LAUNCHER};
pub use pool::{PoolConfig, PoolMetrics, WorkerPool, WorkerSnapshot, WorkerState};
pub use processor::{CommandProcessor, ProcessorSettings};
pub use validator::{LintCommand, SecurityPolicy, ValidationResult, Validator};
