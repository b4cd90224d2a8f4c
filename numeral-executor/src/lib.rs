//! Sandboxed worker execution for the numeral upload pipeline.
//!
//! Confines every filesystem and process path to an approved root or
//! whitelist, owns the lifetime of stored uploads, and runs the external
//! inference worker with a timeout and explicit cancellation.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod handle;
pub mod invoker;
pub mod process;
pub mod sandbox;

pub use backend::{WorkerBackend, WorkerCommand, WorkerOutput};
pub use cleanup::{CleanupGuard, CleanupOutcome};
pub use config::{default_interpreters, WorkerConfig, DEFAULT_INTERPRETER, DEFAULT_WORKER_TIMEOUT};
pub use error::ExecutorError;
pub use handle::{cancellation, CancelHandle, CancelSignal};
pub use invoker::{parse_worker_output, InferenceInvoker};
pub use process::ProcessBackend;
pub use sandbox::{PathSandbox, SandboxedPath};
