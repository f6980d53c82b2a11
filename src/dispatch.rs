//! Messages exchanged with out-of-process tool executors.
//!
//! Dispatch is fire-and-forget. Executors answer with a
//! [`ToolResultMessage`] delivered to
//! [`TurnEngine::on_tool_result`](crate::TurnEngine::on_tool_result); replies
//! may arrive in any order, more than once, or never.

use crate::types::{ConversationId, OperationId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Request for an executor to run one tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDispatch {
    pub conversation_id: ConversationId,
    /// Turn the result must be reported under.
    pub turn: u32,
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    /// Pending operation that receives the eventual turn result.
    pub reply_to: OperationId,
}

impl ToolDispatch {
    /// The result message an executor sends back for this dispatch.
    #[must_use]
    pub fn reply(&self, payload: serde_json::Value) -> ToolResultMessage {
        ToolResultMessage {
            conversation_id: self.conversation_id.clone(),
            turn: self.turn,
            tool_call_id: self.tool_call_id.clone(),
            payload,
        }
    }
}

/// An executor's answer for one tool call. The payload is opaque.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub conversation_id: ConversationId,
    pub turn: u32,
    pub tool_call_id: String,
    pub payload: serde_json::Value,
}

/// Hands tool calls to their executors.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Send one tool call to its executor. Must not wait for the result.
    ///
    /// # Errors
    /// Returns an error if the message could not be handed off.
    async fn dispatch(&self, message: ToolDispatch) -> Result<()>;
}

/// Dispatcher for executors running in the same process.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<ToolDispatch>,
}

impl ChannelDispatcher {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ToolDispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ToolDispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: ToolDispatch) -> Result<()> {
        self.tx
            .send(message)
            .ok()
            .context("tool executor channel closed")
    }
}
