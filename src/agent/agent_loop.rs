//! The Think-Act loop.
//!
//! Each turn runs as an explicit state machine:
//!
//! ```text
//! AwaitingModel -> ModelResponded -> DispatchingTools -> AwaitingModel ...
//!                               \-> Complete
//! ```
//!
//! with `Failed` and `Cancelled` as the other terminal states. The number of
//! model rounds per turn is bounded by `AgentConfig::max_iterations`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::agent::dispatcher::{Confirmer, ToolDispatcher};
use crate::agent::mode::{Mode, ModeHandle};
use crate::agent::status::{StatusSender, StatusUpdate, preview};
use crate::agent::transcript::{ToolResult, Transcript, Turn};
use crate::config::{AgentConfig, LlmConfig};
use crate::error::{AgentError, DispatchError, HistoryError};
use crate::history::TranscriptStore;
use crate::llm::{LlmProvider, ToolCall, ToolCompletionRequest, ToolDefinition};

const PLAN_PROMPT: &str = "\
You are OpsPilot, a DevOps assistant in PLAN MODE.

PLAN MODE RULES:
- You can ONLY read files and gather information
- You CANNOT execute shell commands, write files, or make changes
- Your goal is to create a detailed step-by-step plan
- Use the available read-only tools to gather information before planning

Every plan should cover:
1. Current state analysis
2. Step-by-step implementation plan
3. Potential risks and mitigations
4. Prerequisites and dependencies

When the plan is complete, tell the user they can switch to BUILD MODE to execute it.";

const BUILD_PROMPT: &str = "\
You are OpsPilot, a DevOps assistant in BUILD MODE.

BUILD MODE RULES:
- You can execute shell commands and modify files inside the workspace
- Explain what you are about to do before taking action
- Be cautious with destructive operations; risky actions are confirmed by the user
- Verify the result of each operation

For each step:
1. Explain the action you're about to take
2. Execute the command or make the change
3. Verify the result
4. Report success or failure with details

If a tool result starts with \"Error:\", read it and choose a different approach \
instead of repeating the same call.";

/// Characters kept in a tool result preview.
const PREVIEW_CHARS: usize = 120;

/// Where the current or last turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingModel,
    ModelResponded,
    DispatchingTools,
    Complete,
    Failed,
    Cancelled,
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model answered without tool calls.
    Complete { response: String },
    /// The turn was aborted; the transcript stays usable for the next turn.
    Failed { error: AgentError },
    Cancelled,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Snapshot reported by [`Orchestrator::conversation_summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub mode: Mode,
    pub message_count: usize,
    pub available_tools: Vec<String>,
    pub current_model: String,
    pub session_id: String,
}

/// Model and sampling parameters sent with each request.
#[derive(Debug, Clone, Default)]
struct RequestSettings {
    plan_model: Option<String>,
    build_model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

/// Drives turns between the user, the model and the tools.
///
/// The orchestrator exclusively owns the transcript; one turn is in flight
/// at a time because `submit` takes `&mut self`.
pub struct Orchestrator {
    llm: Arc<dyn LlmProvider>,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
    request: RequestSettings,
    mode: ModeHandle,
    transcript: Transcript,
    state: TurnState,
    session_id: String,
    store: Option<Arc<dyn TranscriptStore>>,
    status: Option<StatusSender>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmProvider>, dispatcher: ToolDispatcher, config: AgentConfig) -> Self {
        let mode = ModeHandle::new(config.initial_mode);
        Self {
            llm,
            dispatcher,
            config,
            request: RequestSettings::default(),
            mode,
            transcript: Transcript::new(),
            state: TurnState::Idle,
            session_id: crate::history::new_session_id(),
            store: None,
            status: None,
        }
    }

    /// Use the per-mode models and sampling parameters from `llm`.
    pub fn with_llm_config(mut self, llm: &LlmConfig) -> Self {
        self.request = RequestSettings {
            plan_model: Some(llm.plan_model.clone()),
            build_model: Some(llm.build_model.clone()),
            max_tokens: Some(llm.max_tokens),
            temperature: Some(llm.temperature),
        };
        self
    }

    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = Some(status);
        self
    }

    /// Persist to `store` under `session_id`, rehydrating whatever the store
    /// already holds for it.
    pub async fn attach_store(
        &mut self,
        store: Arc<dyn TranscriptStore>,
        session_id: impl Into<String>,
    ) -> Result<usize, HistoryError> {
        let session_id = session_id.into();
        crate::history::validate_session_id(&session_id)?;
        let turns = store.load(&session_id).await?;
        let restored = turns.len();
        if restored > 0 {
            tracing::info!(session_id = %session_id, turns = restored, "Resumed session");
        }
        self.transcript = Transcript::from_turns(turns);
        self.session_id = session_id;
        self.store = Some(store);
        Ok(restored)
    }

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// Shared handle for switching modes from another task.
    pub fn mode_handle(&self) -> ModeHandle {
        self.mode.clone()
    }

    /// Switch modes. A turn in flight picks the change up at its next model
    /// round.
    pub fn set_mode(&self, mode: Mode) {
        let previous = self.mode.set(mode);
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "Mode changed");
            self.emit(StatusUpdate::ModeChanged { from: previous, to: mode });
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drop the transcript and continue under a fresh session id. The old
    /// session stays in the store; later turns persist under the new id.
    pub fn new_session(&mut self) -> &str {
        let previous = std::mem::replace(&mut self.session_id, crate::history::new_session_id());
        self.transcript = Transcript::new();
        self.state = TurnState::Idle;
        tracing::info!(from = %previous, to = %self.session_id, "Started new session");
        &self.session_id
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Model used for the current mode.
    pub fn current_model(&self) -> String {
        let configured = match self.mode() {
            Mode::Plan => self.request.plan_model.as_deref(),
            Mode::Build => self.request.build_model.as_deref(),
        };
        configured.unwrap_or_else(|| self.llm.model_name()).to_string()
    }

    pub fn conversation_summary(&self) -> ConversationSummary {
        let mode = self.mode();
        ConversationSummary {
            mode,
            message_count: self.transcript.len(),
            available_tools: self
                .dispatcher
                .registry()
                .schemas_for(mode)
                .into_iter()
                .map(|s| s.name)
                .collect(),
            current_model: self.current_model(),
            session_id: self.session_id.clone(),
        }
    }

    /// Run one turn for `text`.
    ///
    /// Cancelling `cancel` ends the turn as [`TurnOutcome::Cancelled`] and
    /// kills any running child process. Results already recorded stay in
    /// the transcript.
    pub async fn submit(
        &mut self,
        text: &str,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        self.record(Turn::user(text)).await;

        let turn_cancel = cancel.child_token();
        let outcome = match self.config.turn_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_turn(confirmer, &turn_cancel)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        turn_cancel.cancel();
                        tracing::warn!(timeout_secs = limit.as_secs(), "Turn timed out");
                        TurnOutcome::Failed {
                            error: AgentError::TurnTimeout { timeout: limit },
                        }
                    }
                }
            }
            None => self.run_turn(confirmer, &turn_cancel).await,
        };

        self.state = match &outcome {
            TurnOutcome::Complete { .. } => TurnState::Complete,
            TurnOutcome::Failed { .. } => TurnState::Failed,
            TurnOutcome::Cancelled => TurnState::Cancelled,
        };
        outcome
    }

    async fn run_turn(
        &mut self,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let max = self.config.max_iterations;
        let mut iteration = 0usize;

        loop {
            if iteration >= max {
                tracing::warn!(max_iterations = max, "Turn hit the iteration limit");
                return TurnOutcome::Failed {
                    error: AgentError::IterationLimit { max },
                };
            }
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            iteration += 1;

            // Mode is fixed for the whole round, including its tool batch.
            let mode = self.mode();
            self.state = TurnState::AwaitingModel;
            self.emit(StatusUpdate::Thinking(format!(
                "Thinking ({} mode, round {})",
                mode, iteration
            )));

            let request = self.build_request(mode);
            tracing::debug!(
                iteration,
                mode = %mode,
                messages = request.messages.len(),
                tools = request.tools.len(),
                "Requesting completion"
            );
            let response = tokio::select! {
                r = self.llm.complete_with_tools(request) => r,
                _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(iteration, error = %e, "Model request failed");
                    return TurnOutcome::Failed { error: e.into() };
                }
            };

            self.state = TurnState::ModelResponded;
            let text = response.content.unwrap_or_default();
            let calls = response.tool_calls;
            self.record(Turn::assistant(text.clone(), calls.clone()))
                .await;

            if calls.is_empty() {
                tracing::debug!(iteration, "Turn complete");
                return TurnOutcome::Complete { response: text };
            }

            self.state = TurnState::DispatchingTools;
            if let Some(outcome) = self.dispatch_batch(&calls, mode, confirmer, cancel).await {
                return outcome;
            }
        }
    }

    /// Dispatch one batch sequentially, recording each result as it lands.
    ///
    /// Returns `Some` only when the turn was cancelled mid-batch.
    async fn dispatch_batch(
        &mut self,
        calls: &[ToolCall],
        mode: Mode,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> Option<TurnOutcome> {
        let mut seen: HashSet<&str> = HashSet::new();

        for call in calls {
            if cancel.is_cancelled() {
                return Some(TurnOutcome::Cancelled);
            }

            if !seen.insert(call.id.as_str()) {
                let err = DispatchError::DuplicateCallId {
                    id: call.id.clone(),
                };
                tracing::warn!(tool = %call.name, call_id = %call.id, "Duplicate tool call id");
                self.record(ToolResult::error(&call.id, &call.name, err.to_string()).into())
                    .await;
                continue;
            }

            self.emit(StatusUpdate::ToolStarted {
                call_id: call.id.clone(),
                name: call.name.clone(),
            });
            let start = Instant::now();
            let result = match self
                .dispatcher
                .try_dispatch(call, mode, confirmer, cancel)
                .await
            {
                Ok(output) => ToolResult {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: output.content(),
                    is_error: output.is_error,
                },
                // The call never produced a result; leave it absent.
                Err(DispatchError::Cancelled { .. }) if cancel.is_cancelled() => {
                    return Some(TurnOutcome::Cancelled);
                }
                Err(e) => ToolResult::error(&call.id, &call.name, e.to_string()),
            };

            self.emit(StatusUpdate::ToolCompleted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                success: !result.is_error,
                elapsed: start.elapsed(),
            });
            self.emit(StatusUpdate::ToolResult {
                name: call.name.clone(),
                preview: preview(&result.content, PREVIEW_CHARS),
            });
            self.record(result.into()).await;
        }

        None
    }

    fn build_request(&self, mode: Mode) -> ToolCompletionRequest {
        let tools: Vec<ToolDefinition> = self
            .dispatcher
            .registry()
            .schemas_for(mode)
            .into_iter()
            .map(ToolDefinition::from)
            .collect();
        let messages = self.transcript.to_messages(system_prompt(mode));

        let mut request = ToolCompletionRequest::new(messages, tools);
        let model = match mode {
            Mode::Plan => self.request.plan_model.as_ref(),
            Mode::Build => self.request.build_model.as_ref(),
        };
        if let Some(model) = model {
            request = request.with_model(model.clone());
        }
        if let Some(max_tokens) = self.request.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.request.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    /// Append to the transcript, then to the store. Store failures are
    /// logged and do not affect the turn.
    async fn record(&mut self, turn: Turn) {
        self.transcript.push(turn);
        if let (Some(store), Some(turn)) = (&self.store, self.transcript.last()) {
            if let Err(e) = store.append(&self.session_id, turn).await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to persist turn");
            }
        }
    }

    fn emit(&self, update: StatusUpdate) {
        if let Some(tx) = &self.status {
            let _ = tx.send(update);
        }
    }
}

/// System prompt for `mode`. Not part of the transcript.
pub fn system_prompt(mode: Mode) -> &'static str {
    match mode {
        Mode::Plan => PLAN_PROMPT,
        Mode::Build => BUILD_PROMPT,
    }
}
