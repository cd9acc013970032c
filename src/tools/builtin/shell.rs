//! Shell execution tool.
//!
//! Every command goes through [`ExecutionSandbox::run`], which is the only
//! place a process is spawned. The command string the model sent is the
//! string the classifier judged and the string `sh -c` receives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::sandbox::ExecutionSandbox;
use crate::tools::builtin::path_utils::absolutize;
use crate::tools::tool::{Action, Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Extra time granted above the sandbox's own timeout before the dispatcher
/// gives up on the tool.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Shell command execution tool.
#[derive(Debug)]
pub struct ShellTool {
    sandbox: Arc<ExecutionSandbox>,
}

impl ShellTool {
    pub fn new(sandbox: Arc<ExecutionSandbox>) -> Self {
        Self { sandbox }
    }

    /// Command string and absolutized working directory from the params.
    fn command_parts(
        &self,
        params: &serde_json::Value,
    ) -> Result<(String, Option<PathBuf>), ToolError> {
        let command = require_str(params, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidParameters(
                "command must not be empty".into(),
            ));
        }
        let working_dir = params
            .get("working_directory")
            .and_then(|v| v.as_str())
            .map(|dir| absolutize(dir, self.sandbox.root()))
            .transpose()?;
        Ok((command.to_string(), working_dir))
    }
}

fn env_overrides(params: &serde_json::Value) -> Result<Vec<(String, String)>, ToolError> {
    let Some(env) = params.get("env") else {
        return Ok(Vec::new());
    };
    let map = env
        .as_object()
        .ok_or_else(|| ToolError::InvalidParameters("'env' must be an object".into()))?;
    map.iter()
        .map(|(key, value)| match value.as_str() {
            Some(v) => Ok((key.clone(), v.to_string())),
            None => Err(ToolError::InvalidParameters(format!(
                "env value for '{}' must be a string",
                key
            ))),
        })
        .collect()
}

impl From<SandboxError> for ToolError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::PathRestriction { .. } => ToolError::NotAuthorized(e.to_string()),
            SandboxError::Cancelled => ToolError::Cancelled,
            SandboxError::Spawn { .. } | SandboxError::Io(_) => {
                ToolError::ExecutionFailed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return stdout, stderr, exit code \
         and whether it timed out. Commands that change the system may need user confirmation; \
         some are always blocked."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_directory": {
                    "type": "string",
                    "description": "Working directory inside the workspace (optional)"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds (optional, clamped to the configured maximum)"
                },
                "env": {
                    "type": "object",
                    "properties": {},
                    "additionalProperties": { "type": "string" },
                    "description": "Extra environment variables for the command (optional)"
                }
            },
            "required": ["command"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        let (command, working_dir) = self.command_parts(params)?;
        Ok(Some(Action::Command {
            command,
            working_dir,
        }))
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let (command, working_dir) = match &ctx.action {
            Some(Action::Command {
                command,
                working_dir,
            }) => (command.clone(), working_dir.clone()),
            _ => self.command_parts(&params)?,
        };

        let requested = params
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        let timeout = self.sandbox.config().effective_timeout(requested);
        let env = env_overrides(&params)?;

        let result = self
            .sandbox
            .run(&command, working_dir.as_deref(), timeout, &env, &ctx.cancel)
            .await?;

        let is_error = result.timed_out;
        let duration = result.duration;
        let value = serde_json::to_value(&result)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to encode result: {}", e)))?;

        Ok(ToolOutput::success(value, duration).with_error(is_error))
    }

    fn execution_timeout(&self) -> Duration {
        self.sandbox.config().max_timeout + self.sandbox.config().drain_grace + TIMEOUT_SLACK
    }
}
