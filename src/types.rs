//! Core types for durable turns.
//!
//! - [`ConversationId`]: key for everything persisted about a conversation
//! - [`OperationId`]: the caller's pending operation the result is delivered to
//! - [`TokenUsage`]: token consumption, cumulative over a logical turn
//! - [`TurnState`]: durable record of a turn suspended on tool results
//! - [`ToolResultFragment`]: one tool's answer for one turn
//! - [`TurnResult`] / [`TurnOutcome`]: what a turn produced
//! - [`TurnError`]: fatal turn failures

use crate::config::ModelParams;
use crate::llm::{McpServer, Message, Tool, Usage};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of a conversation; scopes turn state, fragments, guard and timeout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the caller's pending operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub const fn add(&mut self, other: &Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        Self::new(usage.input_tokens, usage.output_tokens)
    }
}

/// Durable record of one turn suspended on tool results.
///
/// Never mutated in place once persisted: resumption takes the record and
/// builds the next turn from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnState {
    pub conversation_id: ConversationId,
    /// Pending operation the eventual result is delivered against.
    pub caller_id: OperationId,
    /// Conversation history, append-only.
    pub messages: Vec<Message>,
    /// Tool calls dispatched for this turn, in the order the model issued them.
    pub outstanding: Vec<String>,
    /// Incremented on every suspension.
    pub turn: u32,
    pub params: ModelParams,
    pub tools: Vec<Tool>,
    pub mcp_servers: Vec<McpServer>,
    pub schema: Option<serde_json::Value>,
    /// Attempts allowed for structured object extraction.
    pub max_retries: u32,
    /// Usage accumulated by every model call of the logical turn so far.
    pub usage: TokenUsage,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl TurnState {
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        !self.outstanding.is_empty()
    }
}

/// One tool's result for one turn. Written once, expires passively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultFragment {
    pub tool_call_id: String,
    pub turn: u32,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
}

impl ToolResultFragment {
    #[must_use]
    pub fn new(tool_call_id: impl Into<String>, turn: u32, payload: serde_json::Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            turn,
            payload,
            stored_at: OffsetDateTime::now_utc(),
        }
    }

    /// Payload as the text placed into the next model message.
    #[must_use]
    pub fn payload_text(&self) -> String {
        payload_to_text(&self.payload)
    }
}

/// Strings are used verbatim; anything else is serialized as JSON.
#[must_use]
pub fn payload_to_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Terminal result delivered to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub text: Option<String>,
    pub object: Option<serde_json::Value>,
    pub usage: TokenUsage,
}

/// What a call into the turn executor produced.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    /// The turn finished and the result was delivered.
    Completed(TurnResult),
    /// Tools were dispatched; the turn waits for their results.
    Suspended {
        conversation_id: ConversationId,
        turn: u32,
        outstanding: Vec<String>,
    },
}

/// Outcome of handling one tool result message.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolResultOutcome {
    /// A timeout reconciliation holds the race guard; redeliver later.
    Deferred,
    /// No suspended turn matches the message.
    Stale,
    /// Stored; still waiting on these tool calls.
    Waiting { missing: Vec<String> },
    /// All results arrived and the turn was resumed.
    Resumed(TurnOutcome),
}

/// Outcome of a timeout firing.
#[derive(Clone, Debug, PartialEq)]
pub enum TimeoutOutcome {
    /// Another reconciliation holds the race guard.
    Busy,
    /// Nothing is suspended for the conversation.
    NothingPending,
    /// Results are incomplete; the caller was failed with a timeout.
    TimedOut { missing: Vec<String> },
    /// All results had arrived; the turn was resumed.
    Resumed(TurnOutcome),
}

/// Classification of fatal turn failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnErrorKind {
    /// Invalid parameters or missing credentials; rejected before the turn starts.
    Configuration,
    /// Non-transient upstream failure.
    Upstream,
    /// Transient upstream failures outlasted the retry budget.
    RetriesExhausted,
    /// The model stopped for a reason the engine does not handle.
    UnexpectedStop,
    /// End of turn without any text.
    MissingText,
    /// No schema-conformant object within the extraction budget.
    ObjectExtraction,
    /// Tool results did not arrive within the wait window.
    Timeout,
    /// A tool call could not be handed to its executor.
    Dispatch,
    /// The durable store failed.
    Store,
}

/// Error from the turn engine.
#[derive(Debug, Clone)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
}

impl TurnError {
    #[must_use]
    pub fn new(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(TurnErrorKind::Configuration, message)
    }

    #[must_use]
    pub fn store(error: &anyhow::Error) -> Self {
        Self::new(TurnErrorKind::Store, format!("Turn store error: {error:#}"))
    }

    /// Whether the host may reasonably start the turn again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TurnErrorKind::RetriesExhausted | TurnErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TurnError {}
