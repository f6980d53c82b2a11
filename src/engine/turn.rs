use super::TurnEngine;
use crate::dispatch::ToolDispatch;
use crate::llm::{ChatRequest, ChatResponse, LlmProvider, StopReason};
use crate::stores::TurnStore;
use crate::types::{TokenUsage, TurnError, TurnErrorKind, TurnOutcome, TurnResult, TurnState};
use futures::future::join_all;
use log::{debug, info};

/// A tool call issued by the model.
#[derive(Clone, Debug)]
struct ToolCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

/// What to do with a model response.
#[derive(Debug)]
enum ResponseAction {
    /// End of turn with text and no schema requested.
    Finish { text: String },
    /// End of turn with a schema requested; text may be absent.
    Extract { text: Option<String> },
    /// The model asked for tools.
    Dispatch { calls: Vec<ToolCall> },
    /// End of turn without text and no schema.
    MissingText,
    /// Any stop reason the engine does not handle.
    Unexpected { stop_reason: Option<StopReason> },
}

fn classify(response: &ChatResponse, wants_object: bool) -> ResponseAction {
    match response.stop_reason {
        Some(StopReason::EndTurn) => {
            let text = response.last_text().map(str::to_string);
            match (text, wants_object) {
                (text, true) => ResponseAction::Extract { text },
                (Some(text), false) => ResponseAction::Finish { text },
                (None, false) => ResponseAction::MissingText,
            }
        }
        Some(StopReason::ToolUse) => ResponseAction::Dispatch {
            calls: response
                .tool_uses()
                .map(|(id, name, input)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                })
                .collect(),
        },
        stop_reason => ResponseAction::Unexpected { stop_reason },
    }
}

fn build_request(state: &TurnState) -> ChatRequest {
    ChatRequest {
        model: state.params.model.clone(),
        system: state.params.system_prompt.clone(),
        messages: state.messages.clone(),
        tools: if state.tools.is_empty() {
            None
        } else {
            Some(state.tools.clone())
        },
        mcp_servers: state.mcp_servers.clone(),
        max_tokens: state.params.max_tokens,
        temperature: state.params.temperature,
        tool_choice: state.params.tool_choice.clone(),
        thinking: state.params.thinking,
    }
}

impl<P, S> TurnEngine<P, S>
where
    P: LlmProvider + 'static,
    S: TurnStore + 'static,
{
    /// Run one model call for `state` and act on the response.
    ///
    /// `state` must carry no outstanding tool calls.
    pub(super) async fn execute_turn(&self, mut state: TurnState) -> Result<TurnOutcome, TurnError> {
        self.report_progress(&state.caller_id, "Thinking...").await;

        let request = build_request(&state);
        let response = match self.call_llm_with_retry(&state.caller_id, request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail_turn(&state, e).await),
        };
        state.usage.add(&TokenUsage::from(response.usage));

        debug!(
            "Model responded (conversation_id={}, turn={}, stop_reason={:?}, blocks={})",
            state.conversation_id,
            state.turn,
            response.stop_reason,
            response.content.len()
        );

        match classify(&response, state.schema.is_some()) {
            ResponseAction::Finish { text } => {
                let result = TurnResult {
                    text: Some(text),
                    object: None,
                    usage: state.usage,
                };
                Ok(self.finalize(&state, result).await)
            }
            ResponseAction::Extract { text } => {
                state.messages.push(response.to_message());
                self.extract_object(state, text).await
            }
            ResponseAction::Dispatch { calls } => self.suspend(state, &response, calls).await,
            ResponseAction::MissingText => {
                let error = TurnError::new(
                    TurnErrorKind::MissingText,
                    "Model ended the turn without any text",
                );
                Err(self.fail_turn(&state, error).await)
            }
            ResponseAction::Unexpected { stop_reason } => {
                let error = TurnError::new(
                    TurnErrorKind::UnexpectedStop,
                    format!("Unexpected stop reason: {stop_reason:?}"),
                );
                Err(self.fail_turn(&state, error).await)
            }
        }
    }

    /// Persist the turn, arm its timeout, then hand every tool call to its
    /// executor.
    ///
    /// The state is saved before anything is dispatched so a fast executor
    /// always finds it.
    async fn suspend(
        &self,
        mut state: TurnState,
        response: &ChatResponse,
        calls: Vec<ToolCall>,
    ) -> Result<TurnOutcome, TurnError> {
        if calls.is_empty() {
            let error = TurnError::new(
                TurnErrorKind::UnexpectedStop,
                "Model stopped for tool use without calling any tool",
            );
            return Err(self.fail_turn(&state, error).await);
        }

        for call in &calls {
            self.report_progress(&state.caller_id, &format!("Calling tool {}", call.name))
                .await;
        }

        state.messages.push(response.to_message());
        state.outstanding = calls.iter().map(|c| c.id.clone()).collect();
        state.turn += 1;

        if let Err(e) = self
            .store
            .save_turn_state(&state, self.config.state_ttl)
            .await
        {
            return Err(self.fail_turn(&state, TurnError::store(&e)).await);
        }
        if let Err(e) = self
            .scheduler
            .schedule(&state.conversation_id, self.config.tool_wait)
            .await
        {
            return Err(self.fail_turn(&state, TurnError::store(&e)).await);
        }

        let dispatches = calls.into_iter().map(|call| {
            self.dispatcher.dispatch(ToolDispatch {
                conversation_id: state.conversation_id.clone(),
                turn: state.turn,
                tool_call_id: call.id,
                tool_name: call.name,
                input: call.input,
                reply_to: state.caller_id.clone(),
            })
        });
        let failures: Vec<String> = join_all(dispatches)
            .await
            .into_iter()
            .filter_map(|r| r.err().map(|e| format!("{e:#}")))
            .collect();
        if !failures.is_empty() {
            let error = TurnError::new(
                TurnErrorKind::Dispatch,
                format!("Failed to dispatch tool calls: {}", failures.join("; ")),
            );
            return Err(self.fail_turn(&state, error).await);
        }

        info!(
            "Turn suspended on tool results (conversation_id={}, turn={}, outstanding={:?})",
            state.conversation_id, state.turn, state.outstanding
        );
        self.report_progress(
            &state.caller_id,
            &format!("Waiting for {} tool result(s)", state.outstanding.len()),
        )
        .await;

        Ok(TurnOutcome::Suspended {
            conversation_id: state.conversation_id,
            turn: state.turn,
            outstanding: state.outstanding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, Usage};
    use serde_json::json;

    fn response(stop_reason: Option<StopReason>, content: Vec<ContentBlock>) -> ChatResponse {
        ChatResponse {
            id: "msg_1".to_string(),
            content,
            model: "mock-model".to_string(),
            stop_reason,
            usage: Usage::default(),
        }
    }

    fn text(text: &str) -> ContentBlock {
        ContentBlock::Text {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_end_turn_with_text_finishes() {
        let r = response(Some(StopReason::EndTurn), vec![text("a"), text("b")]);
        assert!(matches!(
            classify(&r, false),
            ResponseAction::Finish { text } if text == "b"
        ));
    }

    #[test]
    fn test_end_turn_with_schema_extracts_even_without_text() {
        let r = response(Some(StopReason::EndTurn), vec![]);
        assert!(matches!(
            classify(&r, true),
            ResponseAction::Extract { text: None }
        ));
    }

    #[test]
    fn test_end_turn_without_text_is_missing_text() {
        let r = response(Some(StopReason::EndTurn), vec![]);
        assert!(matches!(classify(&r, false), ResponseAction::MissingText));
    }

    #[test]
    fn test_tool_use_collects_calls_in_order() {
        let r = response(
            Some(StopReason::ToolUse),
            vec![
                text("let me check"),
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "a".to_string(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "t2".to_string(),
                    name: "b".to_string(),
                    input: json!({"x": 1}),
                },
            ],
        );
        let ResponseAction::Dispatch { calls } = classify(&r, false) else {
            panic!("Expected Dispatch");
        };
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(calls[1].input, json!({"x": 1}));
    }

    #[test]
    fn test_other_stop_reasons_are_unexpected() {
        for stop_reason in [
            Some(StopReason::MaxTokens),
            Some(StopReason::StopSequence),
            Some(StopReason::PauseTurn),
            Some(StopReason::Refusal),
            None,
        ] {
            let r = response(stop_reason, vec![text("partial")]);
            assert!(
                matches!(classify(&r, false), ResponseAction::Unexpected { .. }),
                "{stop_reason:?} should be unexpected"
            );
        }
    }
}
