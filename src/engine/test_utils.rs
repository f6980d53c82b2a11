use super::TurnEngine;
use crate::config::{EngineConfig, RetryConfig};
use crate::dispatch::{ToolDispatch, ToolDispatcher};
use crate::llm::{
    ChatOutcome, ChatRequest, ChatResponse, ContentBlock, LlmProvider, StopReason, Tool, Usage,
};
use crate::operations::{InMemoryOperations, OperationRecord};
use crate::stores::{InMemoryTurnStore, TurnStore};
use crate::timeouts::TimeoutScheduler;
use crate::types::{ConversationId, OperationId, ToolResultFragment, TurnState};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

// ===================
// Mock LLM Provider
// ===================

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<Result<ChatOutcome>>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_times: Mutex<Vec<Instant>>,
    call_count: AtomicUsize,
}

/// Scripted provider. Clones share the script and the recorded requests.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new(responses: Vec<ChatOutcome>) -> Self {
        let provider = Self::default();
        for response in responses {
            provider.push(response);
        }
        provider
    }

    pub fn push(&self, outcome: ChatOutcome) {
        self.state
            .responses
            .lock()
            .expect("lock")
            .push_back(Ok(outcome));
    }

    /// Script a transport-level failure.
    pub fn push_error(&self, message: &str) {
        self.state
            .responses
            .lock()
            .expect("lock")
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    pub fn call_count(&self) -> usize {
        self.state.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.state.requests.lock().expect("lock").clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state.call_times.lock().expect("lock").clone()
    }

    fn response(content: Vec<ContentBlock>, stop_reason: StopReason, usage: Usage) -> ChatOutcome {
        ChatOutcome::Success(ChatResponse {
            id: "msg_1".to_string(),
            content,
            model: "mock-model".to_string(),
            stop_reason: Some(stop_reason),
            usage,
        })
    }

    pub fn text_response(text: &str) -> ChatOutcome {
        Self::text_response_with_usage(text, 10, 20)
    }

    pub fn text_response_with_usage(text: &str, input: u32, output: u32) -> ChatOutcome {
        Self::response(
            vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            StopReason::EndTurn,
            Usage {
                input_tokens: input,
                output_tokens: output,
            },
        )
    }

    pub fn tool_uses_response(tool_uses: Vec<(&str, &str, serde_json::Value)>) -> ChatOutcome {
        let content = tool_uses
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect();
        Self::response(
            content,
            StopReason::ToolUse,
            Usage {
                input_tokens: 10,
                output_tokens: 20,
            },
        )
    }

    pub fn tool_use_response(tool_id: &str, tool_name: &str, input: serde_json::Value) -> ChatOutcome {
        Self::tool_uses_response(vec![(tool_id, tool_name, input)])
    }

    /// A forced `json` tool call carrying `object`.
    pub fn json_response(object: serde_json::Value) -> ChatOutcome {
        Self::tool_use_response("json_call", "json", object)
    }

    pub fn stop_response(stop_reason: StopReason) -> ChatOutcome {
        Self::response(
            vec![ContentBlock::Text {
                text: "partial".to_string(),
            }],
            stop_reason,
            Usage::default(),
        )
    }

    pub fn server_error(status: u16) -> ChatOutcome {
        ChatOutcome::ServerError {
            status,
            message: "upstream failure".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        self.state.call_count.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().expect("lock").push(request);
        self.state
            .call_times
            .lock()
            .expect("lock")
            .push(Instant::now());

        let next = self.state.responses.lock().expect("lock").pop_front();
        next.unwrap_or_else(|| Ok(Self::text_response("Done")))
    }

    fn provider(&self) -> &'static str {
        "mock"
    }
}

// ===================
// Recording Dispatcher
// ===================

#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<ToolDispatch>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        let dispatcher = Self::default();
        dispatcher.fail.store(true, Ordering::SeqCst);
        dispatcher
    }

    pub fn dispatched(&self) -> Vec<ToolDispatch> {
        self.dispatched.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ToolDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: ToolDispatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("executor unavailable for {}", message.tool_name);
        }
        self.dispatched
            .lock()
            .ok()
            .context("lock poisoned")?
            .push(message);
        Ok(())
    }
}

// ===================
// Recording Scheduler
// ===================

#[derive(Default)]
pub struct RecordingScheduler {
    active: Mutex<HashMap<ConversationId, Duration>>,
    schedule_count: AtomicUsize,
    clear_count: AtomicUsize,
}

impl RecordingScheduler {
    pub fn scheduled(&self, conversation_id: &ConversationId) -> Option<Duration> {
        self.active
            .lock()
            .expect("lock")
            .get(conversation_id)
            .copied()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedule_count.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clear_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeoutScheduler for RecordingScheduler {
    async fn schedule(&self, conversation_id: &ConversationId, after: Duration) -> Result<()> {
        self.schedule_count.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .ok()
            .context("lock poisoned")?
            .insert(conversation_id.clone(), after);
        Ok(())
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<()> {
        self.clear_count.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .ok()
            .context("lock poisoned")?
            .remove(conversation_id);
        Ok(())
    }
}

// ===================
// Hooked Store
// ===================

/// In-memory store that can fail fragment reads, or act as if another
/// handler resumed the turn right after its fragments were read.
#[derive(Default)]
pub struct HookedStore {
    inner: InMemoryTurnStore,
    fail_fragment_reads: AtomicBool,
    advance_on_read: Mutex<Option<TurnState>>,
}

impl HookedStore {
    pub fn fail_fragment_reads(&self) {
        self.fail_fragment_reads.store(true, Ordering::SeqCst);
    }

    /// On the next fragment read, replace the suspended turn with `next`.
    pub fn advance_on_next_read(&self, next: TurnState) {
        *self.advance_on_read.lock().expect("lock") = Some(next);
    }
}

#[async_trait]
impl TurnStore for HookedStore {
    async fn save_turn_state(&self, state: &TurnState, ttl: Option<Duration>) -> Result<()> {
        self.inner.save_turn_state(state, ttl).await
    }

    async fn load_turn_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<TurnState>> {
        self.inner.load_turn_state(conversation_id).await
    }

    async fn take_turn_state(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Option<TurnState>> {
        self.inner.take_turn_state(conversation_id, turn).await
    }

    async fn delete_turn_state(&self, conversation_id: &ConversationId) -> Result<()> {
        self.inner.delete_turn_state(conversation_id).await
    }

    async fn store_fragment(
        &self,
        conversation_id: &ConversationId,
        fragment: ToolResultFragment,
        ttl: Duration,
    ) -> Result<bool> {
        self.inner.store_fragment(conversation_id, fragment, ttl).await
    }

    async fn list_fragments(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Vec<ToolResultFragment>> {
        if self.fail_fragment_reads.load(Ordering::SeqCst) {
            bail!("fragment store unavailable");
        }
        let fragments = self.inner.list_fragments(conversation_id, turn).await?;

        let next = self.advance_on_read.lock().ok().context("lock poisoned")?.take();
        if let Some(next) = next {
            self.inner.take_turn_state(conversation_id, turn).await?;
            self.inner.save_turn_state(&next, None).await?;
        }
        Ok(fragments)
    }

    async fn try_acquire_guard(
        &self,
        conversation_id: &ConversationId,
        ttl: Duration,
    ) -> Result<Option<Uuid>> {
        self.inner.try_acquire_guard(conversation_id, ttl).await
    }

    async fn release_guard(
        &self,
        conversation_id: &ConversationId,
        owner: Uuid,
    ) -> Result<bool> {
        self.inner.release_guard(conversation_id, owner).await
    }

    async fn is_guard_held(&self, conversation_id: &ConversationId) -> Result<bool> {
        self.inner.is_guard_held(conversation_id).await
    }
}

// ===================
// Harness
// ===================

pub struct Harness<S: TurnStore = InMemoryTurnStore> {
    pub engine: TurnEngine<MockProvider, S>,
    pub provider: MockProvider,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub scheduler: Arc<RecordingScheduler>,
    pub operations: Arc<InMemoryOperations>,
}

impl Harness {
    pub fn new(responses: Vec<ChatOutcome>) -> Self {
        Self::with(responses, test_config(), RecordingDispatcher::default())
    }

    pub fn with(
        responses: Vec<ChatOutcome>,
        config: EngineConfig,
        dispatcher: RecordingDispatcher,
    ) -> Self {
        Harness::with_store(responses, config, dispatcher, InMemoryTurnStore::new())
    }
}

impl<S: TurnStore + 'static> Harness<S> {
    pub fn with_store(
        responses: Vec<ChatOutcome>,
        config: EngineConfig,
        dispatcher: RecordingDispatcher,
        store: S,
    ) -> Self {
        let provider = MockProvider::new(responses);
        let dispatcher = Arc::new(dispatcher);
        let scheduler = Arc::new(RecordingScheduler::default());
        let operations = Arc::new(InMemoryOperations::new());
        let engine = TurnEngine::new(
            provider.clone(),
            store,
            dispatcher.clone(),
            scheduler.clone(),
            operations.clone(),
            config,
        );
        Self {
            engine,
            provider,
            dispatcher,
            scheduler,
            operations,
        }
    }

    pub fn operation(&self, id: &OperationId) -> OperationRecord {
        self.operations
            .get(id)
            .expect("lock")
            .expect("operation exists")
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig::no_retry(),
        ..EngineConfig::default()
    }
}

pub fn lookup_tool() -> Tool {
    Tool {
        name: "lookup".to_string(),
        description: "Look something up".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"]
        }),
    }
}
