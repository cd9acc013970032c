//! Tool dispatch: the single path from a model tool call to a tool result.
//!
//! Every call goes through the same gates, in order:
//! lookup, argument validation, mode check, safety classification and
//! confirmation, then execution under the tool's time budget. Any failure
//! becomes an error-flagged [`ToolResult`]; nothing here aborts the loop.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::Mode;
use crate::agent::transcript::ToolResult;
use crate::error::{DispatchError, ErrorCategory};
use crate::llm::ToolCall;
use crate::safety::{RiskVerdict, SafetyClassifier};
use crate::tools::{Action, Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};

/// Tracing target for safety decisions.
pub const AUDIT_TARGET: &str = "opspilot::audit";

/// Asks the user whether a risky action may run.
///
/// Returning `false` is a decline. Implementations should not block the
/// runtime; the dispatcher races the answer against turn cancellation.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, description: &str) -> bool;
}

#[async_trait]
impl<F> Confirmer for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn confirm(&self, description: &str) -> bool {
        self(description)
    }
}

/// Routes tool calls through validation and the safety gate.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    classifier: Arc<SafetyClassifier>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, classifier: SafetyClassifier) -> Self {
        Self {
            registry,
            classifier: Arc::new(classifier),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn classifier(&self) -> &SafetyClassifier {
        &self.classifier
    }

    /// Dispatch a call and turn the outcome into a transcript-ready result.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        mode: Mode,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> ToolResult {
        match self.try_dispatch(call, mode, confirmer, cancel).await {
            Ok(output) => ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: output.content(),
                is_error: output.is_error,
            },
            Err(e) => ToolResult::error(&call.id, &call.name, e.to_string()),
        }
    }

    /// Dispatch a call, keeping the typed failure.
    pub async fn try_dispatch(
        &self,
        call: &ToolCall,
        mode: Mode,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, DispatchError> {
        let result = self.run_gates(call, mode, confirmer, cancel).await;
        if let Err(e) = &result {
            log_failure(call, mode, e);
        }
        result
    }

    async fn run_gates(
        &self,
        call: &ToolCall,
        mode: Mode,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, DispatchError> {
        let name = call.name.as_str();
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::NotFound {
                name: name.to_string(),
            })?;

        if let Some(Err(errors)) = self.registry.validate_arguments(name, &call.arguments) {
            return Err(DispatchError::InvalidParameters {
                name: name.to_string(),
                reason: errors.join("; "),
            });
        }

        let mutating = tool.is_mutating();
        if mutating && !mode.allows_mutation() {
            return Err(DispatchError::ModeViolation {
                name: name.to_string(),
                mode: mode.to_string(),
            });
        }

        let action = tool
            .action(&call.arguments)
            .map_err(|e| map_tool_error(name, e))?;
        match &action {
            Some(action) => self.gate(name, mutating, action, confirmer, cancel).await?,
            None if mutating => {
                return Err(DispatchError::InvalidParameters {
                    name: name.to_string(),
                    reason: "could not determine what this call would change".to_string(),
                });
            }
            None => {}
        }

        self.execute(tool, call, action, cancel).await
    }

    /// Classify the action and obtain confirmation where required.
    ///
    /// Only `Forbidden` applies to read-only tools; confirmation is reserved
    /// for mutating ones.
    async fn gate(
        &self,
        name: &str,
        mutating: bool,
        action: &Action,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let classification = self.classifier.classify(action);
        tracing::debug!(
            tool = %name,
            verdict = %classification.verdict,
            rule = classification.rule.as_deref().unwrap_or("-"),
            "Classified action"
        );

        match classification.verdict {
            RiskVerdict::Forbidden => Err(DispatchError::Forbidden {
                rule: classification.rule.unwrap_or_default(),
                reason: classification.reason,
            }),
            RiskVerdict::RequiresConfirmation if mutating => {
                let description = format!(
                    "{}: {} ({})",
                    name,
                    action.describe(),
                    classification.reason
                );
                let approved = tokio::select! {
                    approved = confirmer.confirm(&description) => approved,
                    _ = cancel.cancelled() => {
                        return Err(DispatchError::Cancelled { name: name.to_string() });
                    }
                };
                if approved {
                    tracing::info!(
                        target: AUDIT_TARGET,
                        tool = %name,
                        rule = classification.rule.as_deref().unwrap_or("-"),
                        action = %action.describe(),
                        "User approved risky action"
                    );
                    Ok(())
                } else {
                    Err(DispatchError::UserDeclined {
                        name: name.to_string(),
                    })
                }
            }
            RiskVerdict::RequiresConfirmation | RiskVerdict::Safe => Ok(()),
        }
    }

    async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCall,
        action: Option<Action>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, DispatchError> {
        let name = call.name.as_str();
        let ctx = ToolContext::new(&call.id, cancel.clone()).with_action(action);
        let timeout = tool.execution_timeout();

        tracing::debug!(tool = %name, call_id = %call.id, "Tool call started");
        let start = Instant::now();
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, tool.execute(call.arguments.clone(), &ctx)) => r,
            _ = cancel.cancelled() => {
                return Err(DispatchError::Cancelled { name: name.to_string() });
            }
        };
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    tool = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    is_error = output.is_error,
                    "Tool call succeeded"
                );
                Ok(output)
            }
            Ok(Err(e)) => Err(map_tool_error(name, e)),
            Err(_) => Err(DispatchError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }
}

fn map_tool_error(name: &str, err: ToolError) -> DispatchError {
    let name = name.to_string();
    match err {
        ToolError::InvalidParameters(reason) => DispatchError::InvalidParameters { name, reason },
        ToolError::ExecutionFailed(reason) => DispatchError::ExecutionFailed { name, reason },
        ToolError::Timeout(timeout) => DispatchError::Timeout { name, timeout },
        ToolError::NotAuthorized(reason) => DispatchError::PathRestriction { reason },
        ToolError::Cancelled => DispatchError::Cancelled { name },
    }
}

fn log_failure(call: &ToolCall, mode: Mode, err: &DispatchError) {
    match err.category() {
        ErrorCategory::SafetyViolation => tracing::warn!(
            target: AUDIT_TARGET,
            tool = %call.name,
            call_id = %call.id,
            mode = %mode,
            error = %err,
            "Tool call blocked"
        ),
        ErrorCategory::Resource => tracing::warn!(
            tool = %call.name,
            call_id = %call.id,
            error = %err,
            "Tool call hit a resource restriction"
        ),
        category => tracing::debug!(
            tool = %call.name,
            call_id = %call.id,
            category = %category,
            error = %err,
            "Tool call failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::testing::SpyTool;
    use crate::tools::FileOp;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn dispatcher_with(tools: Vec<SpyTool>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool.into_arc()).unwrap();
        }
        ToolDispatcher::new(Arc::new(registry), SafetyClassifier::default())
    }

    fn approve(_: &str) -> bool {
        true
    }

    fn decline(_: &str) -> bool {
        false
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dispatcher = dispatcher_with(vec![]);
        let err = dispatcher
            .try_dispatch(
                &call("nope", serde_json::json!({})),
                Mode::Build,
                &approve,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_schema_violation_never_executes() {
        let spy = SpyTool::read_only("inspect");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let err = dispatcher
            .try_dispatch(
                &call("inspect", serde_json::json!({"target": 5})),
                Mode::Build,
                &approve,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParameters { .. }));
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_mode_rejects_mutating_tool() {
        let spy = SpyTool::mutating("restart");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let result = dispatcher
            .dispatch(
                &call("restart", serde_json::json!({"target": "echo hi"})),
                Mode::Plan,
                &approve,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("plan mode"));
        assert_eq!(result.call_id, "call_1");
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_safe_mutating_call_runs_without_prompt() {
        let spy = SpyTool::mutating("shell");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let prompts = AtomicU32::new(0);
        let confirmer = |_: &str| {
            prompts.fetch_add(1, Ordering::SeqCst);
            true
        };
        let result = dispatcher
            .dispatch(
                &call("shell", serde_json::json!({"target": "uptime"})),
                Mode::Build,
                &confirmer,
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        assert_eq!(result.content, "ok: uptime");
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
        assert_eq!(spy.call_count(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_never_prompts_or_executes() {
        let spy = SpyTool::mutating("shell");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let prompts = AtomicU32::new(0);
        let confirmer = |_: &str| {
            prompts.fetch_add(1, Ordering::SeqCst);
            true
        };
        let err = dispatcher
            .try_dispatch(
                &call("shell", serde_json::json!({"target": "rm -rf /"})),
                Mode::Build,
                &confirmer,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { ref rule, .. } if rule == "root_wipe"));
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dangerous_needs_confirmation() {
        let spy = SpyTool::mutating("shell");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let args = serde_json::json!({"target": "systemctl restart nginx"});

        let err = dispatcher
            .try_dispatch(&call("shell", args.clone()), Mode::Build, &decline, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserDeclined { .. }));
        assert_eq!(spy.call_count(), 0);

        let output = dispatcher
            .try_dispatch(&call("shell", args), Mode::Build, &approve, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!output.is_error);
        assert_eq!(spy.call_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_description_names_the_action() {
        let spy = SpyTool::mutating("remove").with_file_action(FileOp::Delete);
        let dispatcher = dispatcher_with(vec![spy]);
        let seen = std::sync::Mutex::new(String::new());
        let confirmer = |d: &str| {
            *seen.lock().unwrap() = d.to_string();
            false
        };
        dispatcher
            .dispatch(
                &call("remove", serde_json::json!({"target": "/srv/app/old.log"})),
                Mode::Build,
                &confirmer,
                &CancellationToken::new(),
            )
            .await;
        let description = seen.lock().unwrap().clone();
        assert!(description.contains("remove"), "{description}");
        assert!(description.contains("/srv/app/old.log"), "{description}");
    }

    #[tokio::test]
    async fn test_read_only_tool_blocked_on_forbidden_path() {
        let spy = SpyTool::read_only("peek").with_file_action(FileOp::Read);
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let err = dispatcher
            .try_dispatch(
                &call("peek", serde_json::json!({"target": "/etc/shadow"})),
                Mode::Plan,
                &approve,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported() {
        let spy = SpyTool::read_only("flaky").failing("disk on fire");
        let dispatcher = dispatcher_with(vec![spy]);
        let result = dispatcher
            .dispatch(
                &call("flaky", serde_json::json!({"target": "x"})),
                Mode::Plan,
                &approve,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_execution() {
        let spy = SpyTool::read_only("slow").with_delay(Duration::from_secs(30));
        let dispatcher = dispatcher_with(vec![spy]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .try_dispatch(
                &call("slow", serde_json::json!({"target": "x"})),
                Mode::Plan,
                &approve,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { .. }));
    }

    /// Never answers; the turn has to be cancelled.
    struct SilentConfirmer {
        asked: AtomicU32,
    }

    #[async_trait]
    impl Confirmer for SilentConfirmer {
        async fn confirm(&self, _description: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<bool>().await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_confirmation() {
        let spy = SpyTool::mutating("shell");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        let confirmer = SilentConfirmer {
            asked: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .try_dispatch(
                &call("shell", serde_json::json!({"target": "systemctl restart nginx"})),
                Mode::Build,
                &confirmer,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { .. }), "{err:?}");
        assert_eq!(confirmer.asked.load(Ordering::SeqCst), 1);
        assert_eq!(spy.call_count(), 0);
    }

    #[tokio::test]
    async fn test_shell_wrapped_delete_is_confirmed() {
        let spy = SpyTool::mutating("shell");
        let dispatcher = dispatcher_with(vec![spy.clone()]);
        for command in ["bash -c 'rm -rf data'", "if true; then rm -rf data; fi"] {
            let err = dispatcher
                .try_dispatch(
                    &call("shell", serde_json::json!({"target": command})),
                    Mode::Build,
                    &decline,
                    &CancellationToken::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::UserDeclined { .. }), "{command}");
        }
        assert_eq!(spy.call_count(), 0);
    }

    #[test]
    fn test_tool_error_mapping() {
        assert!(matches!(
            map_tool_error("read_file", ToolError::NotAuthorized("outside".into())),
            DispatchError::PathRestriction { .. }
        ));
        assert!(matches!(
            map_tool_error("x", ToolError::Timeout(Duration::from_secs(1))),
            DispatchError::Timeout { .. }
        ));
    }
}
