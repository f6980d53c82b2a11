//! Collects tool result fragments for a suspended turn.

use crate::llm::Message;
use crate::stores::TurnStore;
use crate::types::{ConversationId, ToolResultFragment};
use anyhow::Result;
use log::debug;
use std::collections::HashMap;

/// Snapshot of which tool results have arrived for one turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregation {
    pub complete: bool,
    /// Tool call id to result text.
    pub results: HashMap<String, String>,
    /// Expected ids without a result, in expected order.
    pub missing: Vec<String>,
}

/// Read the fragments stored under exactly `turn` and check them against the
/// expected tool call ids. Never writes.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub async fn aggregate<S>(
    store: &S,
    conversation_id: &ConversationId,
    turn: u32,
    expected: &[String],
) -> Result<Aggregation>
where
    S: TurnStore + ?Sized,
{
    let fragments = store.list_fragments(conversation_id, turn).await?;
    Ok(collect(fragments, turn, expected))
}

fn collect(fragments: Vec<ToolResultFragment>, turn: u32, expected: &[String]) -> Aggregation {
    let results: HashMap<String, String> = fragments
        .into_iter()
        .filter(|f| f.turn == turn)
        .map(|f| {
            let text = f.payload_text();
            (f.tool_call_id, text)
        })
        .collect();

    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !results.contains_key(*id))
        .cloned()
        .collect();

    debug!(
        "Aggregated tool results (turn={turn}, expected={}, received={}, missing={})",
        expected.len(),
        results.len(),
        missing.len()
    );

    Aggregation {
        complete: missing.is_empty(),
        results,
        missing,
    }
}

/// Build the single user message carrying one tool result per dispatched call,
/// in dispatch order. Ids without a result are left out.
#[must_use]
pub fn tool_result_message(outstanding: &[String], results: &HashMap<String, String>) -> Message {
    let entries = outstanding
        .iter()
        .filter_map(|id| results.get(id).map(|text| (id.clone(), text.clone())))
        .collect();
    Message::tool_results(entries)
}
