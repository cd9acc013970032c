//! Progress events emitted while a turn runs.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::agent::Mode;

/// Status updates for the terminal front end.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Waiting on the model.
    Thinking(String),
    /// Tool execution started.
    ToolStarted { call_id: String, name: String },
    /// Tool execution completed.
    ToolCompleted {
        call_id: String,
        name: String,
        success: bool,
        elapsed: Duration,
    },
    /// Brief preview of tool execution output.
    ToolResult { name: String, preview: String },
    /// Mode switched between turns.
    ModeChanged { from: Mode, to: Mode },
}

pub type StatusSender = mpsc::UnboundedSender<StatusUpdate>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusUpdate>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}

/// Shorten tool output to a single-line preview.
pub(crate) fn preview(content: &str, max_chars: usize) -> String {
    let line = content.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(max_chars).collect();
    if line.chars().count() > max_chars || content.lines().nth(1).is_some() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 4), "abcd...");
        assert_eq!(preview("one\ntwo", 10), "one...");
        assert_eq!(preview("", 10), "");
    }
}
