//! Execution sandbox for shell commands.
//!
//! Commands run as host child processes with:
//! - Working directory restricted to an allowed root
//! - A hard timeout that kills the whole process group
//! - Bounded stdout/stderr capture with truncation counts
//! - Cancellation through a [`tokio_util::sync::CancellationToken`]

mod config;
mod process;

pub use config::SandboxConfig;
pub use process::{ExecutionResult, ExecutionSandbox};
