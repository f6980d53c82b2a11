//! Durable Turns - resumable LLM turns with out-of-process tool execution.
//!
//! A turn that needs tools is persisted, its tool calls are dispatched to
//! executors that may live in other processes, and the turn is resumed by
//! whichever handler observes the last result or the wait-window timeout.
//! Nothing but the [`TurnStore`] carries state between those calls.
//!
//! - Tool results are aggregated per turn; stale and duplicate results are
//!   dropped
//! - A conversation-scoped race guard keeps the timeout path and the result
//!   path from both resuming a turn
//! - Structured output is extracted through a forced `json` tool call and
//!   validated against a JSON Schema
//! - Transient upstream failures are retried with capped exponential backoff
//!
//! # Example
//!
//! ```ignore
//! use durable_turns::{
//!     ChannelDispatcher, ConversationId, EngineConfig, InMemoryOperations, InMemoryTurnStore,
//!     TokioTimeoutScheduler, TurnEngine, TurnRequest, providers::AnthropicProvider,
//! };
//! use std::sync::Arc;
//!
//! let (dispatcher, tool_calls) = ChannelDispatcher::new();
//! let (scheduler, fired) = TokioTimeoutScheduler::new();
//! let engine = TurnEngine::new(
//!     AnthropicProvider::from_env()?,
//!     InMemoryTurnStore::new(),
//!     Arc::new(dispatcher),
//!     Arc::new(scheduler),
//!     Arc::new(InMemoryOperations::new()),
//!     EngineConfig::default(),
//! );
//! tokio::spawn(engine.clone().drive_timeouts(fired));
//!
//! let outcome = engine
//!     .start_turn(TurnRequest::new(ConversationId::new(), "Hello!"))
//!     .await?;
//! // Executors read `tool_calls` and report back through `engine.on_tool_result`.
//! ```

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod dispatch;
mod engine;
pub mod guard;
pub mod llm;
pub mod operations;
pub mod providers;
pub mod schema;
pub mod stores;
pub mod timeouts;
mod types;

pub use config::{EngineConfig, ModelParams, RetryConfig};
pub use dispatch::{ChannelDispatcher, ToolDispatch, ToolDispatcher, ToolResultMessage};
pub use engine::{TurnEngine, TurnRequest};
pub use guard::RaceGuard;
pub use llm::LlmProvider;
pub use operations::{InMemoryOperations, OperationRecord, OperationSink, OperationStatus};
pub use stores::{InMemoryTurnStore, TurnStore};
pub use timeouts::{TimeoutScheduler, TokioTimeoutScheduler};
pub use types::{
    ConversationId, OperationId, TimeoutOutcome, TokenUsage, ToolResultFragment,
    ToolResultOutcome, TurnError, TurnErrorKind, TurnOutcome, TurnResult, TurnState,
    payload_to_text,
};
