//! Engine and per-turn configuration.

use crate::llm::{ThinkingConfig, Tool, ToolChoice};
use crate::providers::anthropic::MODEL_SONNET_45;
use crate::types::TurnError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the turn engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Retry configuration for transient upstream errors
    pub retry: RetryConfig,
    /// How long a suspended turn waits for tool results before reconciling
    pub tool_wait: Duration,
    /// Passive expiry of stored tool result fragments
    pub fragment_ttl: Duration,
    /// Expiry of the race guard, so an abandoned guard cannot block forever
    pub guard_ttl: Duration,
    /// Passive expiry of persisted turn state; `None` keeps it until taken
    pub state_ttl: Option<Duration>,
    /// Keep turn state after a wait-window timeout so a late result can still
    /// resume it.
    pub preserve_state_on_timeout: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            tool_wait: Duration::from_secs(120),
            fragment_ttl: Duration::from_secs(600),
            guard_ttl: Duration::from_secs(120),
            state_ttl: Some(Duration::from_secs(3600)),
            preserve_state_on_timeout: false,
        }
    }
}

/// Configuration for retry behavior on transient errors.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (for testing)
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Create a retry config with fast retries (for testing)
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Model and request parameters for one conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub tool_choice: ToolChoice,
    pub thinking: Option<ThinkingConfig>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: String::from(MODEL_SONNET_45),
            max_tokens: 4096,
            system_prompt: String::new(),
            temperature: None,
            tool_choice: ToolChoice::Auto,
            thinking: None,
        }
    }
}

impl ModelParams {
    /// Reject parameter combinations the model would refuse.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self, tools: &[Tool]) -> Result<(), TurnError> {
        if self.model.trim().is_empty() {
            return Err(TurnError::configuration("Model is required"));
        }
        if self.max_tokens == 0 {
            return Err(TurnError::configuration(
                "max_tokens must be greater than zero",
            ));
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=1.0).contains(&temperature)
        {
            return Err(TurnError::configuration(format!(
                "temperature must be between 0 and 1, got {temperature}"
            )));
        }
        if let Some(thinking) = self.thinking {
            if thinking.budget_tokens < ThinkingConfig::MIN_BUDGET_TOKENS {
                return Err(TurnError::configuration(format!(
                    "thinking budget must be at least {} tokens, got {}",
                    ThinkingConfig::MIN_BUDGET_TOKENS,
                    thinking.budget_tokens
                )));
            }
            if thinking.budget_tokens >= self.max_tokens {
                return Err(TurnError::configuration(format!(
                    "thinking budget ({}) must be less than max_tokens ({})",
                    thinking.budget_tokens, self.max_tokens
                )));
            }
        }
        if let ToolChoice::Tool { name } = &self.tool_choice
            && !tools.iter().any(|t| &t.name == name)
        {
            return Err(TurnError::configuration(format!(
                "tool_choice names unknown tool: {name}"
            )));
        }
        Ok(())
    }
}
