//! Anthropic Messages API wire types and conversions.

use crate::llm::{
    ChatRequest, Content, ContentBlock, McpServer, Role, StopReason, ThinkingConfig, ToolChoice,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// API Request Types
// ============================================================================

#[derive(Serialize)]
pub struct ApiMessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub messages: &'a [ApiMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ApiTool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ApiToolChoice<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<&'a [ApiMcpServer]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ApiThinkingConfig>,
}

#[derive(Serialize)]
pub struct ApiThinkingConfig {
    #[serde(rename = "type")]
    pub config_type: &'static str,
    pub budget_tokens: u32,
}

impl ApiThinkingConfig {
    pub const fn from_thinking_config(config: &ThinkingConfig) -> Self {
        Self {
            config_type: "enabled",
            budget_tokens: config.budget_tokens,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiToolChoice<'a> {
    Auto,
    Any,
    Tool { name: &'a str },
}

impl<'a> ApiToolChoice<'a> {
    pub fn from_tool_choice(choice: &'a ToolChoice) -> Self {
        match choice {
            ToolChoice::Auto => Self::Auto,
            ToolChoice::Any => Self::Any,
            ToolChoice::Tool { name } => Self::Tool { name },
        }
    }
}

#[derive(Serialize)]
pub struct ApiTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Serialize)]
pub struct ApiMcpServer {
    #[serde(rename = "type")]
    pub server_type: &'static str,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_configuration: Option<ApiMcpToolConfiguration>,
}

#[derive(Serialize)]
pub struct ApiMcpToolConfiguration {
    pub enabled: bool,
    pub allowed_tools: Vec<String>,
}

#[derive(Serialize)]
pub struct ApiMessage {
    pub role: ApiRole,
    pub content: ApiMessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum ApiMessageContent {
    Text(String),
    Blocks(Vec<ApiContentBlockInput>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiContentBlockInput {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    User,
    Assistant,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct ApiResponse {
    pub id: String,
    pub content: Vec<ApiResponseContentBlock>,
    pub model: String,
    pub stop_reason: Option<ApiStopReason>,
    pub usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponseContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Server-side tool blocks (`mcp_tool_use`, `mcp_tool_result`, ...).
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    PauseTurn,
    Refusal,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
pub struct ApiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Build API messages from the chat request.
pub fn build_api_messages(request: &ChatRequest) -> Vec<ApiMessage> {
    request
        .messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::User => ApiRole::User,
                Role::Assistant => ApiRole::Assistant,
            },
            content: match &m.content {
                Content::Text(s) => ApiMessageContent::Text(s.clone()),
                Content::Blocks(blocks) => {
                    ApiMessageContent::Blocks(blocks.iter().map(map_input_block).collect())
                }
            },
        })
        .collect()
}

fn map_input_block(block: &ContentBlock) -> ApiContentBlockInput {
    match block {
        ContentBlock::Text { text } => ApiContentBlockInput::Text { text: text.clone() },
        ContentBlock::Thinking {
            thinking,
            signature,
        } => ApiContentBlockInput::Thinking {
            thinking: thinking.clone(),
            signature: signature.clone(),
        },
        ContentBlock::RedactedThinking { data } => {
            ApiContentBlockInput::RedactedThinking { data: data.clone() }
        }
        ContentBlock::ToolUse { id, name, input } => ApiContentBlockInput::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ApiContentBlockInput::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        },
    }
}

/// Build API tools from the chat request.
pub fn build_api_tools(request: &ChatRequest) -> Option<Vec<ApiTool>> {
    request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    })
}

pub fn build_api_mcp_servers(servers: &[McpServer]) -> Vec<ApiMcpServer> {
    servers
        .iter()
        .map(|s| ApiMcpServer {
            server_type: "url",
            name: s.name.clone(),
            url: s.url.clone(),
            authorization_token: s.authorization_token.clone(),
            tool_configuration: s.allowed_tools.as_ref().map(|allowed| {
                ApiMcpToolConfiguration {
                    enabled: true,
                    allowed_tools: allowed.clone(),
                }
            }),
        })
        .collect()
}

/// Map API stop reason to our `StopReason`; reasons we do not model map to `None`.
pub const fn map_stop_reason(reason: &ApiStopReason) -> Option<StopReason> {
    match reason {
        ApiStopReason::EndTurn => Some(StopReason::EndTurn),
        ApiStopReason::ToolUse => Some(StopReason::ToolUse),
        ApiStopReason::MaxTokens => Some(StopReason::MaxTokens),
        ApiStopReason::StopSequence => Some(StopReason::StopSequence),
        ApiStopReason::PauseTurn => Some(StopReason::PauseTurn),
        ApiStopReason::Refusal => Some(StopReason::Refusal),
        ApiStopReason::Unknown => None,
    }
}

/// Convert API response content blocks, dropping blocks the engine does not model.
pub fn map_content_blocks(blocks: Vec<ApiResponseContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter_map(|b| match b {
            ApiResponseContentBlock::Text { text } => Some(ContentBlock::Text { text }),
            ApiResponseContentBlock::Thinking {
                thinking,
                signature,
            } => Some(ContentBlock::Thinking {
                thinking,
                signature,
            }),
            ApiResponseContentBlock::RedactedThinking { data } => {
                Some(ContentBlock::RedactedThinking { data })
            }
            ApiResponseContentBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            ApiResponseContentBlock::Unknown => None,
        })
        .collect()
}
