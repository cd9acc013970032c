//! Execution sandbox configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Limits applied to every command the sandbox runs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Working directories must resolve inside this root.
    pub allowed_root: PathBuf,
    /// Timeout used when the caller does not ask for one.
    pub default_timeout: Duration,
    /// Upper bound on caller-requested timeouts.
    pub max_timeout: Duration,
    /// Per-stream capture limit; bytes beyond it are drained and counted.
    pub max_output_bytes: usize,
    /// How long to keep draining pipes after the process group is killed.
    pub drain_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_root: PathBuf::from("."),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(600),
            max_output_bytes: 64 * 1024,
            drain_grace: Duration::from_millis(500),
        }
    }
}

impl SandboxConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: root.into(),
            ..Self::default()
        }
    }

    /// Clamp a requested timeout into `1s..=max_timeout`, defaulting when absent.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) => t.clamp(Duration::from_secs(1), self.max_timeout),
            None => self.default_timeout,
        }
    }
}
