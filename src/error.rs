//! Error types for OpsPilot.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the assistant.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the model provider boundary.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rejected the credentials")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },
}

/// Errors raised while building the tool registry at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool '{name}' is already registered")]
    AlreadyRegistered { name: String },

    #[error("Tool '{name}' has an invalid parameter schema: {}", .errors.join("; "))]
    InvalidSchema { name: String, errors: Vec<String> },
}

/// How a dispatch failure is reported and audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The model asked for something malformed (unknown tool, bad arguments, duplicate id).
    Protocol,
    /// Mode restriction or a Forbidden/declined safety verdict.
    SafetyViolation,
    /// Path restriction or I/O failure.
    Resource,
    /// The tool ran and failed, or exceeded its time budget.
    Execution,
    /// The turn was cancelled while the call was in flight.
    Cancellation,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::SafetyViolation => "safety_violation",
            Self::Resource => "resource",
            Self::Execution => "execution",
            Self::Cancellation => "cancellation",
        };
        f.write_str(s)
    }
}

/// Failure of a single tool call. Always surfaced to the model as an
/// error-flagged tool result; never aborts the loop.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Unknown tool '{name}'")]
    NotFound { name: String },

    #[error("Duplicate tool call id '{id}' in one response")]
    DuplicateCallId { id: String },

    #[error("Invalid arguments for '{name}': {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error(
        "Tool '{name}' modifies the system and is not available in {mode} mode. \
         Produce a plan instead; the user can switch to build mode to execute it."
    )]
    ModeViolation { name: String, mode: String },

    #[error("Action blocked by safety rule '{rule}': {reason}")]
    Forbidden { rule: String, reason: String },

    #[error("User declined to run '{name}'")]
    UserDeclined { name: String },

    #[error("Path restriction: {reason}")]
    PathRestriction { reason: String },

    #[error("Tool '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Tool '{name}' was cancelled")]
    Cancelled { name: String },
}

impl DispatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } | Self::DuplicateCallId { .. } | Self::InvalidParameters { .. } => {
                ErrorCategory::Protocol
            }
            Self::ModeViolation { .. } | Self::Forbidden { .. } | Self::UserDeclined { .. } => {
                ErrorCategory::SafetyViolation
            }
            Self::PathRestriction { .. } => ErrorCategory::Resource,
            Self::ExecutionFailed { .. } | Self::Timeout { .. } => ErrorCategory::Execution,
            Self::Cancelled { .. } => ErrorCategory::Cancellation,
        }
    }
}

/// Execution sandbox errors. A timeout is not one of them: it is reported
/// in the `ExecutionResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Working directory {} is outside the allowed root {}", .path.display(), .root.display())]
    PathRestriction { path: PathBuf, root: PathBuf },

    #[error("Failed to spawn command: {reason}")]
    Spawn { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command was cancelled")]
    Cancelled,
}

/// Errors that end a turn.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Turn exceeded the limit of {max} model rounds without a final answer")]
    IterationLimit { max: usize },

    #[error("Turn exceeded its time budget of {timeout:?}")]
    TurnTimeout { timeout: Duration },

    #[error("Turn was cancelled")]
    Cancelled,

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Transcript persistence errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid session id '{id}'")]
    InvalidSessionId { id: String },
}

/// Result type alias for the assistant.
pub type Result<T> = std::result::Result<T, Error>;
