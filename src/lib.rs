//! OpsPilot: a terminal DevOps assistant.
//!
//! A user message starts a turn. The [`agent::Orchestrator`] asks the model
//! for a decision, routes every requested tool call through the
//! [`agent::ToolDispatcher`] (mode check, [`safety::SafetyClassifier`],
//! confirmation) and feeds the results back until the model answers in
//! plain text.
//!
//! Plan mode only exposes read-only tools. Build mode adds file changes and
//! shell commands, which run in the [`sandbox::ExecutionSandbox`].

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod safety;
pub mod sandbox;
pub mod settings;
pub mod testing;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
