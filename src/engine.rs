//! The turn engine: executes turns, suspends them on tool dispatch, and
//! resumes them from whichever process receives the last tool result or the
//! wait-window timeout.
//!
//! Entry points, each invoked independently by the host:
//!
//! - [`TurnEngine::start_turn`] on an inbound request
//! - [`TurnEngine::on_tool_result`] when an executor reports a result
//! - [`TurnEngine::on_timeout`] when a wait window elapses
//!
//! No in-memory continuation survives between calls; everything needed to
//! resume lives in the [`TurnStore`].

mod extract;
mod llm;
mod resume;
mod turn;

#[cfg(test)]
mod test_utils;

use crate::config::{EngineConfig, ModelParams};
use crate::dispatch::ToolDispatcher;
use crate::llm::{LlmProvider, McpServer, Message, Tool, ToolChoice};
use crate::operations::OperationSink;
use crate::stores::TurnStore;
use crate::timeouts::TimeoutScheduler;
use crate::types::{
    ConversationId, OperationId, TokenUsage, TurnError, TurnOutcome, TurnResult, TurnState,
};
use log::{error, info, warn};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Everything needed to start a turn.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    /// Pending operation that receives progress and the final result.
    pub caller_id: OperationId,
    /// Prior history plus the new user message.
    pub messages: Vec<Message>,
    pub params: ModelParams,
    pub tools: Vec<Tool>,
    pub mcp_servers: Vec<McpServer>,
    /// Request a structured object conforming to this JSON Schema.
    pub schema: Option<serde_json::Value>,
    /// Attempts allowed for structured object extraction.
    pub max_retries: u32,
}

impl TurnRequest {
    #[must_use]
    pub fn new(conversation_id: ConversationId, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id,
            caller_id: OperationId::new(),
            messages: vec![Message::user(prompt)],
            params: ModelParams::default(),
            tools: Vec::new(),
            mcp_servers: Vec::new(),
            schema: None,
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn with_caller(mut self, caller_id: OperationId) -> Self {
        self.caller_id = caller_id;
        self
    }

    /// Prepend earlier conversation history before the prompt.
    #[must_use]
    pub fn with_history(mut self, mut history: Vec<Message>) -> Self {
        history.append(&mut self.messages);
        self.messages = history;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_mcp_servers(mut self, mcp_servers: Vec<McpServer>) -> Self {
        self.mcp_servers = mcp_servers;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value, max_retries: u32) -> Self {
        self.schema = Some(schema);
        self.max_retries = max_retries;
        self
    }

    fn validate(&self) -> Result<(), TurnError> {
        self.params.validate(&self.tools)?;
        if self.messages.is_empty() {
            return Err(TurnError::configuration("A turn needs at least one message"));
        }
        if self.params.tool_choice == ToolChoice::Any
            && self.tools.is_empty()
            && self.mcp_servers.is_empty()
        {
            return Err(TurnError::configuration(
                "tool_choice \"any\" requires at least one tool",
            ));
        }
        if self.schema.is_some() && self.max_retries == 0 {
            return Err(TurnError::configuration(
                "max_retries must be at least 1 when a schema is requested",
            ));
        }
        Ok(())
    }

    fn into_state(self) -> TurnState {
        TurnState {
            conversation_id: self.conversation_id,
            caller_id: self.caller_id,
            messages: self.messages,
            outstanding: Vec::new(),
            turn: 0,
            params: self.params,
            tools: self.tools,
            mcp_servers: self.mcp_servers,
            schema: self.schema,
            max_retries: self.max_retries,
            usage: TokenUsage::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Drives durable turns against a model provider and a turn store.
pub struct TurnEngine<P, S>
where
    P: LlmProvider,
    S: TurnStore,
{
    provider: Arc<P>,
    store: Arc<S>,
    dispatcher: Arc<dyn ToolDispatcher>,
    scheduler: Arc<dyn TimeoutScheduler>,
    operations: Arc<dyn OperationSink>,
    config: EngineConfig,
}

impl<P, S> Clone for TurnEngine<P, S>
where
    P: LlmProvider,
    S: TurnStore,
{
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
            operations: Arc::clone(&self.operations),
            config: self.config.clone(),
        }
    }
}

impl<P, S> TurnEngine<P, S>
where
    P: LlmProvider + 'static,
    S: TurnStore + 'static,
{
    /// Create a new engine with all collaborators specified directly.
    #[must_use]
    pub fn new(
        provider: P,
        store: S,
        dispatcher: Arc<dyn ToolDispatcher>,
        scheduler: Arc<dyn TimeoutScheduler>,
        operations: Arc<dyn OperationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            store: Arc::new(store),
            dispatcher,
            scheduler,
            operations,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a new turn.
    ///
    /// Returns `Completed` if the model finished without tools, or `Suspended`
    /// once tools have been dispatched.
    ///
    /// # Errors
    /// Returns a configuration error before anything is sent, or the fatal
    /// error that ended the turn (the caller's operation is cancelled first).
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnOutcome, TurnError> {
        request.validate()?;

        let existing = self
            .store
            .load_turn_state(&request.conversation_id)
            .await
            .map_err(|e| TurnError::store(&e))?;
        if existing.is_some() {
            return Err(TurnError::configuration(format!(
                "Conversation {} already has a suspended turn",
                request.conversation_id
            )));
        }

        self.operations
            .begin(&request.caller_id)
            .await
            .map_err(|e| TurnError::store(&e))?;

        info!(
            "Starting turn (conversation_id={}, operation_id={}, tools={}, mcp_servers={}, schema={})",
            request.conversation_id,
            request.caller_id,
            request.tools.len(),
            request.mcp_servers.len(),
            request.schema.is_some()
        );

        self.execute_turn(request.into_state()).await
    }

    /// Feed fired timeouts from `rx` into [`Self::on_timeout`] until the
    /// channel closes. Each timeout is handled on its own task.
    pub async fn drive_timeouts(self, mut rx: mpsc::UnboundedReceiver<ConversationId>) {
        while let Some(conversation_id) = rx.recv().await {
            let engine = self.clone();
            tokio::spawn(async move {
                match engine.on_timeout(&conversation_id).await {
                    Ok(outcome) => {
                        info!("Timeout handled (conversation_id={conversation_id}, outcome={outcome:?})");
                    }
                    Err(e) => {
                        warn!("Timeout handling failed (conversation_id={conversation_id}, error={e})");
                    }
                }
            });
        }
    }

    async fn report_progress(&self, caller_id: &OperationId, status: &str) {
        if let Err(e) = self.operations.update(caller_id, status).await {
            warn!("Failed to report progress (operation_id={caller_id}, status={status}, error={e})");
        }
    }

    async fn finalize(&self, state: &TurnState, result: TurnResult) -> TurnOutcome {
        info!(
            "Turn finalized (conversation_id={}, turn={}, input_tokens={}, output_tokens={}, object={})",
            state.conversation_id,
            state.turn,
            result.usage.input_tokens,
            result.usage.output_tokens,
            result.object.is_some()
        );
        if let Err(e) = self.operations.complete(&state.caller_id, &result).await {
            warn!(
                "Failed to deliver turn result (operation_id={}, error={e})",
                state.caller_id
            );
        }
        TurnOutcome::Completed(result)
    }

    /// Report a fatal failure and discard everything that could resume the turn.
    async fn fail_turn(&self, state: &TurnState, error: TurnError) -> TurnError {
        error!(
            "Turn failed (conversation_id={}, turn={}, kind={:?}, error={})",
            state.conversation_id, state.turn, error.kind, error.message
        );
        if let Err(e) = self.operations.cancel(&state.caller_id, &error.message).await {
            warn!(
                "Failed to cancel operation (operation_id={}, error={e})",
                state.caller_id
            );
        }
        if let Err(e) = self.store.delete_turn_state(&state.conversation_id).await {
            warn!(
                "Failed to discard turn state (conversation_id={}, error={e})",
                state.conversation_id
            );
        }
        self.clear_timeout(&state.conversation_id).await;
        error
    }

    async fn clear_timeout(&self, conversation_id: &ConversationId) {
        if let Err(e) = self.scheduler.clear(conversation_id).await {
            warn!("Failed to clear timeout (conversation_id={conversation_id}, error={e})");
        }
    }
}
