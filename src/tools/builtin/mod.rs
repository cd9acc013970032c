//! Built-in tools that come with the assistant.

mod file;
pub mod path_utils;
mod shell;

pub use file::{ApplyPatchTool, DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use shell::ShellTool;
