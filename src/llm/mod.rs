//! Model provider boundary.
//!
//! The orchestrator depends only on [`LlmProvider`]; every supported provider
//! preset is reached through the OpenAI-compatible adapter.

mod openai_compatible_chat;
mod provider;
pub mod retry;

use std::sync::Arc;

pub use openai_compatible_chat::OpenAiCompatibleChatProvider;
pub use provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Build the provider described by `config`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::debug!(
        provider = %config.provider,
        base_url = %config.base_url,
        plan_model = %config.plan_model,
        build_model = %config.build_model,
        "Creating LLM provider"
    );
    Ok(Arc::new(OpenAiCompatibleChatProvider::new(config.clone())?))
}
