use super::TurnEngine;
use crate::llm::{ChatRequest, LlmProvider, Message, Tool, ToolChoice};
use crate::schema;
use crate::stores::TurnStore;
use crate::types::{TokenUsage, TurnError, TurnErrorKind, TurnOutcome, TurnResult, TurnState};
use log::{info, warn};

/// Name of the tool the model is forced to call with the structured object.
pub(super) const JSON_TOOL_NAME: &str = "json";

impl<P, S> TurnEngine<P, S>
where
    P: LlmProvider + 'static,
    S: TurnStore + 'static,
{
    /// Obtain a schema-conformant object by forcing a call to the `json`
    /// tool, up to `state.max_retries` attempts.
    ///
    /// Thinking content is stripped from the history first.
    pub(super) async fn extract_object(
        &self,
        mut state: TurnState,
        text: Option<String>,
    ) -> Result<TurnOutcome, TurnError> {
        let Some(schema) = state.schema.clone() else {
            let error = TurnError::new(
                TurnErrorKind::ObjectExtraction,
                "No schema to extract an object for",
            );
            return Err(self.fail_turn(&state, error).await);
        };

        let messages: Vec<Message> = state
            .messages
            .iter()
            .filter_map(Message::without_thinking)
            .collect();
        let attempts = state.max_retries;
        let mut last_error: Option<TurnError> = None;

        for attempt in 1..=attempts {
            self.report_progress(
                &state.caller_id,
                &format!("Generating structured output (attempt {attempt} of {attempts})"),
            )
            .await;

            let request = ChatRequest {
                model: state.params.model.clone(),
                system: state.params.system_prompt.clone(),
                messages: messages.clone(),
                tools: Some(vec![Tool {
                    name: JSON_TOOL_NAME.to_string(),
                    description: "Respond with a JSON object matching the input schema."
                        .to_string(),
                    input_schema: schema.clone(),
                }]),
                mcp_servers: Vec::new(),
                max_tokens: state.params.max_tokens,
                temperature: state.params.temperature,
                tool_choice: ToolChoice::Tool {
                    name: JSON_TOOL_NAME.to_string(),
                },
                thinking: None,
            };

            let response = match self.call_llm_with_retry(&state.caller_id, request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Object extraction call failed (conversation_id={}, attempt={attempt}, error={e})",
                        state.conversation_id
                    );
                    last_error = Some(e);
                    continue;
                }
            };
            state.usage.add(&TokenUsage::from(response.usage));

            let Some(object) = response
                .tool_uses()
                .find(|(_, name, _)| *name == JSON_TOOL_NAME)
                .map(|(_, _, input)| input.clone())
            else {
                warn!(
                    "Object extraction returned no json tool call (conversation_id={}, attempt={attempt})",
                    state.conversation_id
                );
                continue;
            };

            match schema::validate(&schema, &object) {
                Ok(()) => {
                    info!(
                        "Structured object extracted (conversation_id={}, attempt={attempt})",
                        state.conversation_id
                    );
                    let result = TurnResult {
                        text,
                        object: Some(object),
                        usage: state.usage,
                    };
                    return Ok(self.finalize(&state, result).await);
                }
                Err(reason) => {
                    warn!(
                        "Extracted object does not match schema (conversation_id={}, attempt={attempt}, reason={reason})",
                        state.conversation_id
                    );
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            TurnError::new(TurnErrorKind::ObjectExtraction, "Failed to generate object")
        });
        Err(self.fail_turn(&state, error).await)
    }
}
