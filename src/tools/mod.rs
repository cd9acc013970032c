//! Tool system.
//!
//! Tools are the assistant's only way to touch the machine. Each one is
//! described by a [`ToolSpec`] advertised to the model, and mutating tools
//! name the concrete [`Action`] they will perform so the safety gate can
//! judge it before anything runs.

pub mod builtin;

mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{
    Action, FileOp, Tool, ToolContext, ToolError, ToolOutput, ToolSpec, require_param,
    require_str, validate_tool_schema,
};
