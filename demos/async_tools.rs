//! Asynchronous tool execution example.
//!
//! A turn calls a weather tool. The tool runs on a separate task that
//! answers through `on_tool_result`, the way an out-of-process executor would,
//! and the turn resumes from there.
//!
//! # Running
//!
//! ```bash
//! ANTHROPIC_API_KEY=your_key cargo run --example async_tools
//! ```
//!
//! To see debug logs from the engine:
//! ```bash
//! RUST_LOG=durable_turns=debug ANTHROPIC_API_KEY=your_key cargo run --example async_tools
//! ```

use durable_turns::llm::Tool;
use durable_turns::providers::AnthropicProvider;
use durable_turns::{
    ChannelDispatcher, ConversationId, EngineConfig, InMemoryOperations, InMemoryTurnStore,
    OperationId, OperationStatus, TokioTimeoutScheduler, ToolDispatch, ToolResultOutcome,
    TurnEngine, TurnOutcome, TurnRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type Engine = TurnEngine<AnthropicProvider, InMemoryTurnStore>;

fn weather_tool() -> Tool {
    Tool {
        name: "get_weather".to_string(),
        description: "Current weather for a city".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        }),
    }
}

/// Executor loop: answers every dispatched call after a short delay.
async fn run_executor(engine: Engine, mut calls: tokio::sync::mpsc::UnboundedReceiver<ToolDispatch>) {
    while let Some(call) = calls.recv().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let city = call.input["city"].as_str().unwrap_or("somewhere");
            let reply = call.reply(json!({ "city": city, "temperature_c": 21, "sky": "clear" }));

            loop {
                match engine.on_tool_result(reply.clone()).await {
                    Ok(ToolResultOutcome::Deferred) => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(outcome) => {
                        println!("[executor] {} -> {outcome:?}", call.tool_call_id);
                        break;
                    }
                    Err(e) => {
                        eprintln!("[executor] {} failed: {e}", call.tool_call_id);
                        break;
                    }
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging for debug output (the engine uses the `log` crate)
    env_logger::init();

    let (dispatcher, calls) = ChannelDispatcher::new();
    let (scheduler, fired) = TokioTimeoutScheduler::new();
    let operations = Arc::new(InMemoryOperations::new());

    let engine: Engine = TurnEngine::new(
        AnthropicProvider::from_env()?,
        InMemoryTurnStore::new(),
        Arc::new(dispatcher),
        Arc::new(scheduler),
        operations.clone(),
        EngineConfig::default(),
    );

    tokio::spawn(engine.clone().drive_timeouts(fired));
    tokio::spawn(run_executor(engine.clone(), calls));

    let conversation_id = ConversationId::new();
    let caller_id = OperationId::new();
    println!("Starting conversation (conversation: {conversation_id})\n");

    let outcome = engine
        .start_turn(
            TurnRequest::new(
                conversation_id,
                "What's the weather in Lisbon and in Oslo? Answer in one sentence.",
            )
            .with_caller(caller_id.clone())
            .with_tools(vec![weather_tool()]),
        )
        .await?;

    if let TurnOutcome::Suspended { outstanding, .. } = &outcome {
        println!("Waiting on {} tool call(s)...", outstanding.len());
    }

    loop {
        let Some(record) = operations.get(&caller_id)? else {
            anyhow::bail!("operation {caller_id} disappeared");
        };
        match record.status {
            OperationStatus::Pending => tokio::time::sleep(Duration::from_millis(200)).await,
            OperationStatus::Completed { result } => {
                println!("\nProgress: {}", record.progress.join(" | "));
                println!("Agent: {}", result.text.unwrap_or_default());
                println!(
                    "Tokens: {} input, {} output",
                    result.usage.input_tokens, result.usage.output_tokens
                );
                break;
            }
            OperationStatus::Cancelled { reason } => {
                eprintln!("Error: {reason}");
                break;
            }
        }
    }

    Ok(())
}
