//! Fault taxonomy and exit-code model shared by the `pexec` process
//! execution engine. Kept dependency-free of any process-spawning code so
//! it can be reused by adapters that never touch `fork`/`exec` directly
//! (e.g. a dry-run validator for call options).

mod exit;
mod fault;

pub use exit::{ExitStatus, OkCodes};
pub use fault::{CapturedOutput, Fault, pick_pipeline_fault, signal_name};

/// Result alias used throughout the engine for operations that can fail
/// with one of the taxonomy's [`Fault`] kinds.
pub type Result<T> = std::result::Result<T, Fault>;
