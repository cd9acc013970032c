//! Core agent logic.
//!
//! The agent is responsible for:
//! - Owning the conversation transcript
//! - Running the Think-Act loop against the model
//! - Routing tool calls through the mode check and safety gate
//! - Reporting progress to the terminal front end

mod agent_loop;
mod dispatcher;
mod mode;
mod status;
mod transcript;

pub use agent_loop::{ConversationSummary, Orchestrator, TurnOutcome, TurnState, system_prompt};
pub use dispatcher::{AUDIT_TARGET, Confirmer, ToolDispatcher};
pub use mode::{Mode, ModeHandle};
pub use status::{StatusReceiver, StatusSender, StatusUpdate, status_channel};
pub use transcript::{ToolResult, Transcript, Turn};
