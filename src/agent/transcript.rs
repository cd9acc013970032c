//! Append-only record of a conversation.
//!
//! The transcript is the single source of truth for what the model has
//! seen. It is rendered into chat messages before every model round.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, ToolCall};

/// Content placed in a synthetic result for a call that never completed.
const ORPHANED_CALL_RESULT: &str = "tool call did not complete (the turn was interrupted)";

/// Outcome of one tool call, as recorded and shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            is_error: true,
            ..Self::success(call_id, tool_name, content)
        }
    }
}

/// One entry in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    UserMessage {
        text: String,
    },
    AssistantMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult(ToolResult),
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::UserMessage { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::AssistantMessage {
            text: text.into(),
            tool_calls,
        }
    }
}

impl From<ToolResult> for Turn {
    fn from(result: ToolResult) -> Self {
        Self::ToolResult(result)
    }
}

/// Ordered, append-only sequence of [`Turn`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a transcript from persisted turns.
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Render the transcript as chat messages, preceded by `system_prompt`.
    ///
    /// Error results are prefixed with `Error: ` so the model can tell them
    /// apart from successful output. A tool call with no recorded result
    /// (the turn was cancelled or timed out mid-batch) gets a synthetic error
    /// result before the next non-result entry, so every assistant tool call
    /// is always answered.
    pub fn to_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(ChatMessage::system(system_prompt));

        let mut pending: Vec<&ToolCall> = Vec::new();
        let mut answered: HashSet<&str> = HashSet::new();

        for turn in &self.turns {
            match turn {
                Turn::UserMessage { text } => {
                    close_orphans(&mut messages, &mut pending, &answered);
                    messages.push(ChatMessage::user(text));
                }
                Turn::AssistantMessage { text, tool_calls } => {
                    close_orphans(&mut messages, &mut pending, &answered);
                    answered.clear();
                    pending.extend(tool_calls.iter());
                    let content = (!text.is_empty()).then(|| text.clone());
                    messages.push(ChatMessage::assistant_with_tool_calls(
                        content,
                        tool_calls.clone(),
                    ));
                }
                Turn::ToolResult(result) => {
                    answered.insert(result.call_id.as_str());
                    let content = if result.is_error {
                        format!("Error: {}", result.content)
                    } else {
                        result.content.clone()
                    };
                    messages.push(ChatMessage::tool_result(
                        &result.call_id,
                        &result.tool_name,
                        content,
                    ));
                }
            }
        }
        close_orphans(&mut messages, &mut pending, &answered);

        messages
    }
}

fn close_orphans(
    messages: &mut Vec<ChatMessage>,
    pending: &mut Vec<&ToolCall>,
    answered: &HashSet<&str>,
) {
    for call in pending.drain(..) {
        if !answered.contains(call.id.as_str()) {
            messages.push(ChatMessage::tool_result(
                &call.id,
                &call.name,
                format!("Error: {}", ORPHANED_CALL_RESULT),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn test_render_full_round() {
        let mut transcript = Transcript::new();
        transcript.push(Turn::user("check disk"));
        transcript.push(Turn::assistant("", vec![call("c1", "run_command")]));
        transcript.push(ToolResult::success("c1", "run_command", "42% used").into());
        transcript.push(Turn::assistant("Disk is at 42%.", vec![]));

        let messages = transcript.to_messages("sys");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "check disk");
        assert_eq!(messages[2].tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[3].content, "42% used");
        assert!(messages[4].tool_calls.is_none());
    }

    #[test]
    fn test_error_results_are_prefixed() {
        let mut transcript = Transcript::new();
        transcript.push(Turn::assistant("", vec![call("c1", "delete_file")]));
        transcript.push(ToolResult::error("c1", "delete_file", "User declined").into());

        let messages = transcript.to_messages("sys");
        assert_eq!(messages[2].content, "Error: User declined");
    }

    #[test]
    fn test_orphaned_calls_get_placeholder_results() {
        let mut transcript = Transcript::new();
        transcript.push(Turn::user("go"));
        transcript.push(Turn::assistant(
            "",
            vec![call("c1", "read_file"), call("c2", "run_command")],
        ));
        transcript.push(ToolResult::success("c1", "read_file", "data").into());
        transcript.push(Turn::user("next question"));

        let messages = transcript.to_messages("sys");
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Tool,
                Role::Tool,
                Role::User
            ]
        );
        assert_eq!(messages[4].tool_call_id.as_deref(), Some("c2"));
        assert!(messages[4].content.starts_with("Error: "));
    }

    #[test]
    fn test_orphans_closed_at_end() {
        let mut transcript = Transcript::new();
        transcript.push(Turn::assistant("", vec![call("c1", "read_file")]));
        let messages = transcript.to_messages("sys");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, Role::Tool);
    }

    #[test]
    fn test_turn_serialization_shape() {
        let turn: Turn = ToolResult::error("c9", "run_command", "boom").into();
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["call_id"], "c9");
        assert_eq!(json["is_error"], true);

        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);

        let user = serde_json::to_value(Turn::user("hi")).unwrap();
        assert_eq!(user, serde_json::json!({"type": "user_message", "text": "hi"}));
    }
}
