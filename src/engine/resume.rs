use super::TurnEngine;
use crate::aggregator::{Aggregation, aggregate, tool_result_message};
use crate::dispatch::ToolResultMessage;
use crate::guard::RaceGuard;
use crate::llm::LlmProvider;
use crate::stores::TurnStore;
use crate::types::{
    ConversationId, TimeoutOutcome, ToolResultFragment, ToolResultOutcome, TurnError,
    TurnErrorKind, TurnOutcome,
};
use log::{debug, info, warn};

impl<P, S> TurnEngine<P, S>
where
    P: LlmProvider + 'static,
    S: TurnStore + 'static,
{
    /// Handle one tool result reported by an executor.
    ///
    /// Results for turns that are no longer suspended are dropped as `Stale`.
    /// While a timeout reconciliation holds the race guard the message is left
    /// untouched and `Deferred` is returned; the host should redeliver it.
    ///
    /// # Errors
    /// Returns a store error if the result could not be recorded (the message
    /// may be redelivered), or the fatal error of a resumed turn.
    pub async fn on_tool_result(
        &self,
        message: ToolResultMessage,
    ) -> Result<ToolResultOutcome, TurnError> {
        let conversation_id = &message.conversation_id;
        let guard = RaceGuard::new(self.store.as_ref(), self.config.guard_ttl);

        if guard
            .is_held(conversation_id)
            .await
            .map_err(|e| TurnError::store(&e))?
        {
            info!(
                "Timeout reconciliation in progress, deferring tool result (conversation_id={conversation_id}, tool_call_id={})",
                message.tool_call_id
            );
            return Ok(ToolResultOutcome::Deferred);
        }

        let state = self
            .store
            .load_turn_state(conversation_id)
            .await
            .map_err(|e| TurnError::store(&e))?;
        let Some(state) = state.filter(|s| {
            s.turn == message.turn && s.outstanding.contains(&message.tool_call_id)
        }) else {
            debug!(
                "Dropping stale tool result (conversation_id={conversation_id}, turn={}, tool_call_id={})",
                message.turn, message.tool_call_id
            );
            return Ok(ToolResultOutcome::Stale);
        };

        self.clear_timeout(conversation_id).await;

        let fragment = ToolResultFragment::new(&message.tool_call_id, message.turn, message.payload);
        let stored = self
            .store
            .store_fragment(conversation_id, fragment, self.config.fragment_ttl)
            .await
            .map_err(|e| TurnError::store(&e))?;
        if !stored {
            debug!(
                "Duplicate tool result ignored (conversation_id={conversation_id}, tool_call_id={})",
                message.tool_call_id
            );
        }

        let aggregation = aggregate(
            self.store.as_ref(),
            conversation_id,
            state.turn,
            &state.outstanding,
        )
        .await
        .map_err(|e| TurnError::store(&e))?;

        if !aggregation.complete {
            self.scheduler
                .schedule(conversation_id, self.config.tool_wait)
                .await
                .map_err(|e| TurnError::store(&e))?;
            debug!(
                "Waiting for remaining tool results (conversation_id={conversation_id}, turn={}, missing={:?})",
                state.turn, aggregation.missing
            );
            self.report_progress(
                &state.caller_id,
                &format!("Waiting for {} tool result(s)", aggregation.missing.len()),
            )
            .await;
            return Ok(ToolResultOutcome::Waiting {
                missing: aggregation.missing,
            });
        }

        match self.resume(conversation_id, state.turn, aggregation).await? {
            Some(outcome) => Ok(ToolResultOutcome::Resumed(outcome)),
            None => Ok(ToolResultOutcome::Stale),
        }
    }

    /// Handle a fired wait-window timeout.
    ///
    /// Runs under the race guard. If every result arrived after all, the turn
    /// resumes; otherwise the caller is failed with a timeout.
    ///
    /// # Errors
    /// Returns a store error, or the fatal error of a resumed turn.
    pub async fn on_timeout(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<TimeoutOutcome, TurnError> {
        let guard = RaceGuard::new(self.store.as_ref(), self.config.guard_ttl);
        let outcome = guard
            .scoped(conversation_id, move || self.reconcile_timeout(conversation_id))
            .await
            .map_err(|e| TurnError::store(&e))?;

        match outcome {
            Some(result) => result,
            None => {
                debug!("Timeout already being reconciled (conversation_id={conversation_id})");
                Ok(TimeoutOutcome::Busy)
            }
        }
    }

    async fn reconcile_timeout(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<TimeoutOutcome, TurnError> {
        let state = self
            .store
            .load_turn_state(conversation_id)
            .await
            .map_err(|e| TurnError::store(&e))?;
        let Some(state) = state.filter(|s| s.is_suspended()) else {
            debug!("Timeout with nothing pending (conversation_id={conversation_id})");
            return Ok(TimeoutOutcome::NothingPending);
        };

        let aggregation = aggregate(
            self.store.as_ref(),
            conversation_id,
            state.turn,
            &state.outstanding,
        )
        .await
        .map_err(|e| TurnError::store(&e))?;

        if aggregation.complete {
            info!(
                "All tool results present at timeout, resuming (conversation_id={conversation_id}, turn={})",
                state.turn
            );
            return Ok(
                match self.resume(conversation_id, state.turn, aggregation).await? {
                    Some(outcome) => TimeoutOutcome::Resumed(outcome),
                    None => TimeoutOutcome::NothingPending,
                },
            );
        }

        // A result handler may have resumed this turn since it was loaded
        let claimed = if self.config.preserve_state_on_timeout {
            self.store
                .load_turn_state(conversation_id)
                .await
                .map_err(|e| TurnError::store(&e))?
                .is_some_and(|current| current.turn == state.turn)
        } else {
            self.store
                .take_turn_state(conversation_id, state.turn)
                .await
                .map_err(|e| TurnError::store(&e))?
                .is_some()
        };
        if !claimed {
            debug!(
                "Turn moved on before the timeout was reconciled (conversation_id={conversation_id}, turn={})",
                state.turn
            );
            return Ok(TimeoutOutcome::NothingPending);
        }

        warn!(
            "Timed out waiting for tool results (conversation_id={conversation_id}, turn={}, missing={:?})",
            state.turn, aggregation.missing
        );
        let error = TurnError::new(
            TurnErrorKind::Timeout,
            format!(
                "Timed out waiting for tool results: {}",
                aggregation.missing.join(", ")
            ),
        );
        if let Err(e) = self.operations.cancel(&state.caller_id, &error.message).await {
            warn!(
                "Failed to cancel operation (operation_id={}, error={e})",
                state.caller_id
            );
        }

        Ok(TimeoutOutcome::TimedOut {
            missing: aggregation.missing,
        })
    }

    /// Claim the suspended turn and continue it with the aggregated results.
    ///
    /// Returns `None` if another path already claimed it.
    async fn resume(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
        aggregation: Aggregation,
    ) -> Result<Option<TurnOutcome>, TurnError> {
        let Some(mut state) = self
            .store
            .take_turn_state(conversation_id, turn)
            .await
            .map_err(|e| TurnError::store(&e))?
        else {
            debug!("Turn already resumed elsewhere (conversation_id={conversation_id}, turn={turn})");
            return Ok(None);
        };

        info!(
            "Resuming turn (conversation_id={conversation_id}, turn={turn}, results={})",
            aggregation.results.len()
        );

        let message = tool_result_message(&state.outstanding, &aggregation.results);
        state.messages.push(message);
        state.outstanding.clear();

        self.execute_turn(state).await.map(Some)
    }
}
