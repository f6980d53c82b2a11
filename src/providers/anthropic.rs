//! Anthropic API provider implementation.
//!
//! This module provides an implementation of `LlmProvider` for the Anthropic
//! Messages API using reqwest for HTTP calls. Remote tool servers are passed
//! through the MCP connector.

pub(crate) mod data;

use crate::llm::{ChatOutcome, ChatRequest, ChatResponse, LlmProvider, Usage};
use crate::types::TurnError;
use anyhow::Result;
use async_trait::async_trait;
use data::{
    ApiErrorResponse, ApiMessagesRequest, ApiThinkingConfig, ApiToolChoice, build_api_mcp_servers,
    build_api_messages, build_api_tools, map_content_blocks, map_stop_reason,
};
use reqwest::StatusCode;

const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MCP_CONNECTOR_BETA: &str = "mcp-client-2025-04-04";

/// Environment variable read by [`AnthropicProvider::from_env`].
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

pub const MODEL_HAIKU_45: &str = "claude-haiku-4-5-20251001";
pub const MODEL_SONNET_45: &str = "claude-sonnet-4-5-20250929";
pub const MODEL_OPUS_46: &str = "claude-opus-4-6";

/// Anthropic LLM provider using the Messages API.
///
/// The model is taken from each request.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the specified API key.
    #[must_use]
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            base_url: API_BASE_URL.to_owned(),
        }
    }

    /// Create a provider from `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    /// Returns a configuration error if the variable is unset or empty.
    pub fn from_env() -> Result<Self, TurnError> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(TurnError::configuration(format!(
                "{API_KEY_ENV} is not set"
            ))),
        }
    }

    /// Point the provider at a different API host, e.g. a proxy.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Classify a non-success HTTP response.
fn classify_failure(status: StatusCode, body: &[u8]) -> ChatOutcome {
    let parsed = serde_json::from_slice::<ApiErrorResponse>(body).ok();
    let message = parsed.as_ref().map_or_else(
        || String::from_utf8_lossy(body).into_owned(),
        |e| e.error.message.clone(),
    );
    let overloaded = parsed
        .as_ref()
        .is_some_and(|e| e.error.error_type == "overloaded_error");

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ChatOutcome::RateLimited;
    }
    if overloaded || status.as_u16() == 529 {
        return ChatOutcome::Overloaded;
    }
    if status.is_server_error() {
        log::error!("Anthropic server error status={status} body={message}");
        return ChatOutcome::ServerError {
            status: status.as_u16(),
            message,
        };
    }
    log::warn!("Anthropic client error status={status} body={message}");
    ChatOutcome::InvalidRequest(message)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let messages = build_api_messages(&request);
        let tools = build_api_tools(&request);
        let mcp_servers = build_api_mcp_servers(&request.mcp_servers);
        let has_tools = tools.as_ref().is_some_and(|t| !t.is_empty()) || !mcp_servers.is_empty();

        let api_request = ApiMessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: Some(request.system.as_str()).filter(|s| !s.is_empty()),
            messages: &messages,
            tools: tools.as_deref(),
            tool_choice: has_tools.then(|| ApiToolChoice::from_tool_choice(&request.tool_choice)),
            mcp_servers: Some(mcp_servers.as_slice()).filter(|s| !s.is_empty()),
            temperature: request.temperature,
            thinking: request
                .thinking
                .as_ref()
                .map(ApiThinkingConfig::from_thinking_config),
        };

        log::debug!(
            "Anthropic LLM request model={} max_tokens={} mcp_servers={}",
            request.model,
            request.max_tokens,
            mcp_servers.len()
        );

        if log::log_enabled!(log::Level::Debug) {
            match serde_json::to_string_pretty(&api_request) {
                Ok(json) => log::debug!("Anthropic API request payload:\n{json}"),
                Err(e) => log::debug!("Failed to serialize request for logging: {e}"),
            }
        }

        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        if !mcp_servers.is_empty() {
            builder = builder.header("anthropic-beta", MCP_CONNECTOR_BETA);
        }

        let response = builder
            .json(&api_request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("request failed: {e}"))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read response body: {e}"))?;

        log::debug!(
            "Anthropic LLM response status={} body_len={}",
            status,
            bytes.len()
        );

        if !status.is_success() {
            return Ok(classify_failure(status, &bytes));
        }

        let api_response: data::ApiResponse = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("failed to parse response: {e}"))?;

        log::debug!(
            "Anthropic API response: id={} model={} stop_reason={:?} usage={{input_tokens={}, output_tokens={}}} content_blocks={}",
            api_response.id,
            api_response.model,
            api_response.stop_reason,
            api_response.usage.input_tokens,
            api_response.usage.output_tokens,
            api_response.content.len()
        );

        let content = map_content_blocks(api_response.content);
        let stop_reason = api_response.stop_reason.as_ref().and_then(map_stop_reason);

        Ok(ChatOutcome::Success(ChatResponse {
            id: api_response.id,
            content,
            model: api_response.model,
            stop_reason,
            usage: Usage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
        }))
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===================
    // Constructor Tests
    // ===================

    #[test]
    fn test_new_uses_public_api() {
        let provider = AnthropicProvider::new("test-api-key".to_string());

        assert_eq!(provider.base_url, API_BASE_URL);
        assert_eq!(provider.provider(), "anthropic");
    }

    #[test]
    fn test_with_base_url_overrides_host() {
        let provider =
            AnthropicProvider::new("test-api-key".to_string()).with_base_url("http://localhost:9");

        assert_eq!(provider.base_url, "http://localhost:9");
    }

    // ===================
    // Failure Classification Tests
    // ===================

    #[test]
    fn test_rate_limit_classified() {
        let outcome = classify_failure(StatusCode::TOO_MANY_REQUESTS, b"{}");
        assert!(matches!(outcome, ChatOutcome::RateLimited));
    }

    #[test]
    fn test_overload_classified_by_status_and_type() {
        let by_status = classify_failure(
            StatusCode::from_u16(529).unwrap(),
            b"not json",
        );
        assert!(matches!(by_status, ChatOutcome::Overloaded));

        let by_type = classify_failure(
            StatusCode::SERVICE_UNAVAILABLE,
            br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(by_type, ChatOutcome::Overloaded));
    }

    #[test]
    fn test_server_error_keeps_status_and_message() {
        let outcome = classify_failure(
            StatusCode::BAD_GATEWAY,
            br#"{"type":"error","error":{"type":"api_error","message":"upstream"}}"#,
        );
        let ChatOutcome::ServerError { status, message } = outcome else {
            panic!("Expected ServerError");
        };
        assert_eq!(status, 502);
        assert_eq!(message, "upstream");
    }

    #[test]
    fn test_client_error_is_invalid_request() {
        let outcome = classify_failure(
            StatusCode::BAD_REQUEST,
            br#"{"type":"error","error":{"type":"invalid_request_error","message":"bad tool"}}"#,
        );
        assert!(matches!(outcome, ChatOutcome::InvalidRequest(m) if m == "bad tool"));
    }
}
