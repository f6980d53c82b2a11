pub mod types;

pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// A model backend the engine can issue requests to.
///
/// Transport failures that the provider could not classify are returned as
/// `Err` and are treated as non-transient.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome>;
    fn provider(&self) -> &'static str;
}
