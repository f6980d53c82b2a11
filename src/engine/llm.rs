use super::TurnEngine;
use crate::llm::{ChatOutcome, ChatRequest, ChatResponse, LlmProvider};
use crate::stores::TurnStore;
use crate::types::{OperationId, TurnError, TurnErrorKind};
use log::{debug, error, warn};
use tokio::time::sleep;

/// Human-readable reason for a failed outcome.
fn failure_reason(outcome: &ChatOutcome) -> String {
    match outcome {
        ChatOutcome::Success(_) => "success".to_string(),
        ChatOutcome::RateLimited => "rate limiting".to_string(),
        ChatOutcome::Overloaded => "provider overload".to_string(),
        ChatOutcome::ServerError { status, message } => {
            format!("server error {status}: {message}")
        }
        ChatOutcome::InvalidRequest(message) => format!("invalid request: {message}"),
    }
}

impl<P, S> TurnEngine<P, S>
where
    P: LlmProvider + 'static,
    S: TurnStore + 'static,
{
    /// Call the model, retrying transient failures with exponential backoff.
    ///
    /// Each retry is announced on the caller's operation before sleeping.
    pub(super) async fn call_llm_with_retry(
        &self,
        caller_id: &OperationId,
        request: ChatRequest,
    ) -> Result<ChatResponse, TurnError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        debug!(
            "Calling model (provider={}, model={}, messages={}, tools={})",
            self.provider.provider(),
            request.model,
            request.messages.len(),
            request.tools.as_ref().map_or(0, Vec::len)
        );

        loop {
            let outcome = match self.provider.chat(request.clone()).await {
                Ok(o) => o,
                Err(e) => {
                    error!("Model call failed (error={e:#})");
                    return Err(TurnError::new(
                        TurnErrorKind::Upstream,
                        format!("LLM error: {e:#}"),
                    ));
                }
            };

            let failure = match outcome {
                ChatOutcome::Success(response) => return Ok(response),
                failure => failure,
            };
            let reason = failure_reason(&failure);

            if !failure.is_transient() {
                error!("Model call rejected (reason={reason})");
                return Err(TurnError::new(
                    TurnErrorKind::Upstream,
                    format!("Model call failed: {reason}"),
                ));
            }

            attempt += 1;
            if attempt > retry.max_retries {
                error!(
                    "Model call failed after retries (reason={reason}, retries={})",
                    retry.max_retries
                );
                return Err(TurnError::new(
                    TurnErrorKind::RetriesExhausted,
                    format!("Gave up after {} retries: {reason}", retry.max_retries),
                ));
            }

            let delay = retry.backoff_delay(attempt);
            warn!(
                "Transient model failure, retrying after backoff (attempt={attempt}, delay_ms={}, reason={reason})",
                delay.as_millis()
            );
            self.report_progress(
                caller_id,
                &format!(
                    "Retrying after {reason} (attempt {attempt} of {})",
                    retry.max_retries
                ),
            )
            .await;

            sleep(delay).await;
        }
    }
}
