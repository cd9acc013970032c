//! OpenAI-compatible Chat Completions provider.
//!
//! Works against any endpoint speaking `/v1/chat/completions` with function
//! tools: OpenAI itself, OpenRouter, Anthropic's compatibility endpoint, and
//! local proxies.
//!
//! Key guarantees:
//! - Robust usage parsing (never panics on malformed/missing token fields)
//! - Provider-bound tool-call name reconciliation for prefixed aliases
//! - Tool-call arguments that are not valid JSON reach the dispatcher as a
//!   string, so they fail schema validation instead of silently becoming `{}`

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse,
};
use crate::llm::retry::{is_retryable_status, parse_retry_after, retry_backoff_delay};

const DEFAULT_MAX_RETRIES: u32 = 3;

const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024; // 10 MB

/// Bytes of request/response bodies shown in debug logs.
const LOG_BODY_LIMIT: usize = 2000;

/// OpenAI-compatible provider implementation over `/v1/chat/completions`.
pub struct OpenAiCompatibleChatProvider {
    client: Client,
    config: LlmConfig,
    max_retries: u32,
}

impl OpenAiCompatibleChatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.provider.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    fn provider(&self) -> String {
        self.config.provider.clone()
    }

    fn api_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');

        if base.ends_with("/v1") {
            format!("{}/{}", base, path)
        } else {
            format!("{}/v1/{}", base, path)
        }
    }

    fn api_key(&self) -> Result<String, LlmError> {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .ok_or_else(|| LlmError::AuthFailed {
                provider: self.provider(),
            })
    }

    async fn send_request<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        body: &T,
    ) -> Result<R, LlmError> {
        let url = self.api_url("chat/completions");
        let api_key = self.api_key()?;

        for attempt in 0..=self.max_retries {
            tracing::debug!(
                url = %url,
                attempt = attempt + 1,
                "Sending chat completion request"
            );

            if tracing::enabled!(tracing::Level::DEBUG)
                && let Ok(json) = serde_json::to_string(body)
            {
                tracing::debug!(body = %truncate_for_log(&json), "Chat completion request body");
            }

            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = retry_backoff_delay(attempt);
                        tracing::warn!(
                            "Chat completion request error (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            self.max_retries + 1,
                            delay,
                            e,
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(LlmError::RequestFailed {
                        provider: self.provider(),
                        reason: e.to_string(),
                    });
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let content_length = response.content_length().unwrap_or(0);
            if content_length > MAX_RESPONSE_BYTES {
                return Err(LlmError::RequestFailed {
                    provider: self.provider(),
                    reason: format!(
                        "Response too large: {} bytes (max {})",
                        content_length, MAX_RESPONSE_BYTES
                    ),
                });
            }
            let response_text = response.text().await.unwrap_or_default();
            if response_text.len() as u64 > MAX_RESPONSE_BYTES {
                return Err(LlmError::RequestFailed {
                    provider: self.provider(),
                    reason: format!(
                        "Response too large: {} bytes (max {})",
                        response_text.len(),
                        MAX_RESPONSE_BYTES
                    ),
                });
            }

            tracing::debug!(
                status = %status,
                body = %truncate_for_log(&response_text),
                "Chat completion response"
            );

            if !status.is_success() {
                let status_code = status.as_u16();

                if status_code == 401 || status_code == 403 {
                    return Err(LlmError::AuthFailed {
                        provider: self.provider(),
                    });
                }

                if is_retryable_status(status_code) && attempt < self.max_retries {
                    let delay = retry_after
                        .unwrap_or_else(|| retry_backoff_delay(attempt))
                        .max(retry_backoff_delay(attempt));
                    tracing::warn!(
                        "Provider returned HTTP {} (attempt {}/{}), retrying in {:?}",
                        status_code,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if status_code == 429 {
                    return Err(LlmError::RateLimited {
                        provider: self.provider(),
                        retry_after,
                    });
                }

                return Err(LlmError::RequestFailed {
                    provider: self.provider(),
                    reason: format!("HTTP {}: {}", status, truncate_for_log(&response_text)),
                });
            }

            return serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
                provider: self.provider(),
                reason: format!(
                    "JSON parse error: {}. Raw: {}",
                    e,
                    truncate_for_log(&response_text)
                ),
            });
        }

        Err(LlmError::RequestFailed {
            provider: self.provider(),
            reason: "retry loop exited unexpectedly".to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleChatProvider {
    fn model_name(&self) -> &str {
        &self.config.plan_model
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let known_tool_names: HashSet<String> = req.tools.iter().map(|t| t.name.clone()).collect();

        let messages: Vec<ChatCompletionMessage> = req
            .messages
            .into_iter()
            .map(ChatCompletionMessage::from)
            .collect();

        let tools: Vec<ChatCompletionTool> = req
            .tools
            .into_iter()
            .map(|t| ChatCompletionTool {
                tool_type: "function".to_string(),
                function: ChatCompletionFunction {
                    name: t.name,
                    description: Some(t.description),
                    parameters: Some(t.parameters),
                },
            })
            .collect();

        let request = ChatCompletionRequest {
            model: req
                .model
                .unwrap_or_else(|| self.model_name().to_string()),
            messages,
            temperature: req.temperature.or(Some(self.config.temperature)),
            max_tokens: req.max_tokens.or(Some(self.config.max_tokens)),
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice: req.tool_choice,
        };

        let response: ChatCompletionResponse = self.send_request(&request).await?;

        let choice =
            response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| LlmError::InvalidResponse {
                    provider: self.provider(),
                    reason: "No choices in response".to_string(),
                })?;

        let content = choice.message.content;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = parse_arguments(&tc.function.arguments);
                let normalized_name = normalize_tool_name(&tc.function.name, &known_tool_names);
                if normalized_name != tc.function.name {
                    tracing::debug!(
                        original = %tc.function.name,
                        normalized = %normalized_name,
                        "Normalized tool call name from provider",
                    );
                }

                ToolCall {
                    id: tc.id,
                    name: normalized_name,
                    arguments,
                }
            })
            .collect();

        let finish_reason =
            parse_finish_reason(choice.finish_reason.as_deref(), !tool_calls.is_empty());
        let (input_tokens, output_tokens) = parse_usage(response.usage.as_ref());

        Ok(ToolCompletionResponse {
            content,
            tool_calls,
            finish_reason,
            input_tokens,
            output_tokens,
        })
    }
}

/// Decode the arguments string of a tool call.
///
/// An empty string means "no arguments". Anything that is not valid JSON is
/// passed on verbatim as a string value.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Tool call arguments are not valid JSON");
        serde_json::Value::String(raw.to_string())
    })
}

fn truncate_for_log(s: &str) -> String {
    if s.len() <= LOG_BODY_LIMIT {
        return s.to_string();
    }
    let mut end = LOG_BODY_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} bytes total]", &s[..end], s.len())
}

fn parse_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        _ if has_tool_calls => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

fn normalize_tool_name(name: &str, known_tools: &HashSet<String>) -> String {
    if known_tools.contains(name) {
        return name.to_string();
    }

    if let Some(stripped) = name.strip_prefix("proxy_")
        && known_tools.contains(stripped)
    {
        return stripped.to_string();
    }

    name.to_string()
}

fn saturate_u32(val: u64) -> u32 {
    val.min(u32::MAX as u64) as u32
}

fn parse_usage(usage: Option<&ChatCompletionUsage>) -> (u32, u32) {
    let Some(usage) = usage else {
        return (0, 0);
    };

    if let Some(completion) = usage.completion_tokens {
        return (
            usage.prompt_tokens.map(saturate_u32).unwrap_or(0),
            saturate_u32(completion),
        );
    }

    if let (Some(total), Some(prompt)) = (usage.total_tokens, usage.prompt_tokens) {
        if total < prompt {
            tracing::warn!(
                total_tokens = total,
                prompt_tokens = prompt,
                "Usage had total_tokens < prompt_tokens; clamping output tokens to 0"
            );
        }
        return (saturate_u32(prompt), saturate_u32(total.saturating_sub(prompt)));
    }

    if let Some(total) = usage.total_tokens {
        return (0, saturate_u32(total));
    }

    if let Some(prompt) = usage.prompt_tokens {
        return (saturate_u32(prompt), 0);
    }

    (0, 0)
}

// OpenAI-compatible Chat Completions API types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatCompletionTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

impl From<ChatMessage> for ChatCompletionMessage {
    fn from(msg: ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ChatCompletionToolCall {
                    id: tc.id,
                    call_type: "function".to_string(),
                    function: ChatCompletionToolCallFunction {
                        name: tc.name,
                        // A string value is the model's own unparsable text; send it back as-is.
                        arguments: match tc.arguments {
                            serde_json::Value::String(raw) => raw,
                            other => other.to_string(),
                        },
                    },
                })
                .collect()
        });

        let content = if role == "assistant" && tool_calls.is_some() && msg.content.is_empty() {
            None
        } else {
            Some(msg.content)
        };

        Self {
            role: role.to_string(),
            content,
            tool_call_id: msg.tool_call_id,
            name: msg.name,
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatCompletionFunction,
}

#[derive(Debug, Serialize)]
struct ChatCompletionFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ChatCompletionToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}
