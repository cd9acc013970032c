//! Test doubles for the model and for tools.
//!
//! Provides:
//! - [`ScriptedLlm`]: an LLM provider that replays a fixed script of responses
//! - [`SpyTool`]: a tool that records how often it ran
//!
//! # Usage
//!
//! ```rust,no_run
//! use opspilot::testing::{ScriptedLlm, SpyTool, text_response, tool_calls_response, tool_call};
//!
//! let llm = ScriptedLlm::new(vec![
//!     tool_calls_response(vec![tool_call("c1", "inspect", serde_json::json!({"target": "x"}))]),
//!     text_response("done"),
//! ]);
//! let spy = SpyTool::read_only("inspect");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::{
    FinishReason, LlmProvider, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use crate::tools::{Action, FileOp, Tool, ToolContext, ToolError, ToolOutput};

/// Build a tool call.
pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// A model response that requests the given tool calls.
pub fn tool_calls_response(tool_calls: Vec<ToolCall>) -> ToolCompletionResponse {
    ToolCompletionResponse {
        content: None,
        tool_calls,
        finish_reason: FinishReason::ToolUse,
        input_tokens: 0,
        output_tokens: 0,
    }
}

/// A final text answer.
pub fn text_response(text: impl Into<String>) -> ToolCompletionResponse {
    ToolCompletionResponse {
        content: Some(text.into()),
        tool_calls: Vec::new(),
        finish_reason: FinishReason::Stop,
        input_tokens: 0,
        output_tokens: 0,
    }
}

/// An LLM provider stub that replays responses in order.
///
/// Supports:
/// - Call counting via [`calls()`](Self::calls)
/// - Request capture via [`requests()`](Self::requests)
/// - Repeating the last response forever via [`looping()`](Self::looping)
/// - Runtime failure toggling via [`set_failing()`](Self::set_failing)
/// - An artificial delay per call via [`with_delay()`](Self::with_delay)
///
/// Once the script runs out (and the stub is not looping) every call fails
/// with `LlmError::InvalidResponse`.
pub struct ScriptedLlm {
    model_name: String,
    script: Mutex<VecDeque<ToolCompletionResponse>>,
    looping: Option<ToolCompletionResponse>,
    requests: Mutex<Vec<ToolCompletionRequest>>,
    call_count: AtomicU32,
    should_fail: AtomicBool,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ToolCompletionResponse>) -> Self {
        Self {
            model_name: "scripted-model".to_string(),
            script: Mutex::new(responses.into()),
            looping: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            delay: None,
        }
    }

    /// A stub that returns `response` on every call.
    pub fn looping(response: ToolCompletionResponse) -> Self {
        Self {
            looping: Some(response),
            ..Self::new(Vec::new())
        }
    }

    /// A stub whose every call fails with a request error.
    pub fn failing() -> Self {
        let llm = Self::new(Vec::new());
        llm.set_failing(true);
        llm
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `complete_with_tools` calls made so far.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ToolCompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    fn next_response(&self) -> Option<ToolCompletionResponse> {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.or_else(|| self.looping.clone())
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        self.next_response()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "script exhausted".to_string(),
            })
    }
}

/// A tool that counts its executions.
///
/// It takes a single required string parameter, `target`. Mutating spies
/// report `Action::Command { command: target }`; spies built with
/// [`with_file_action`](Self::with_file_action) report a file action on
/// `target` instead. Clones share the call counter.
#[derive(Debug, Clone)]
pub struct SpyTool {
    name: String,
    mutating: bool,
    schema: serde_json::Value,
    file_op: Option<FileOp>,
    delay: Option<Duration>,
    failure: Option<String>,
    calls: Arc<AtomicU32>,
}

impl SpyTool {
    fn new(name: &str, mutating: bool) -> Self {
        Self {
            name: name.to_string(),
            mutating,
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "target": { "type": "string" }
                },
                "required": ["target"]
            }),
            file_op: None,
            delay: None,
            failure: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn read_only(name: &str) -> Self {
        Self::new(name, false)
    }

    pub fn mutating(name: &str) -> Self {
        Self::new(name, true)
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_file_action(mut self, op: FileOp) -> Self {
        self.file_op = Some(op);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every execution with `reason`.
    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn into_arc(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for SpyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Test spy"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn is_mutating(&self) -> bool {
        self.mutating
    }

    fn action(&self, params: &serde_json::Value) -> Result<Option<Action>, ToolError> {
        let target = params.get("target").and_then(|v| v.as_str());
        Ok(match (self.file_op, target) {
            (Some(op), Some(target)) => Some(Action::File {
                op,
                path: target.into(),
            }),
            (None, Some(target)) if self.mutating => Some(Action::Command {
                command: target.to_string(),
                working_dir: None,
            }),
            _ => None,
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(ToolError::ExecutionFailed(reason.clone()));
        }
        let target = params
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(ToolOutput::text(format!("ok: {}", target), Duration::ZERO))
    }
}
