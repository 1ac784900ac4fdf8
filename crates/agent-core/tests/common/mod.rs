// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures for the scenario tests: a scripted `stream_fn` driven by a
//! queue of canned turns, plus a couple of deterministic tools.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_core::{ContentBlock, Event, Message, ProviderEvent, ProviderStream, StopReason, StreamFn, StreamOptions, Tool};
use agent_tools::{AbortSignal, OnUpdate, ToolResult};
use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, Value};

/// One canned model turn: the events a `stream_fn` call yields, in order.
pub struct ScriptedTurn {
    pub events: Vec<anyhow::Result<ProviderEvent>>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let message = assistant_message(vec![ContentBlock::text(text.clone())], StopReason::Stop);
        Self {
            events: vec![
                Ok(ProviderEvent::Start { message: message.clone() }),
                Ok(ProviderEvent::TextDelta { text }),
                Ok(ProviderEvent::Done {
                    stop_reason: StopReason::Stop,
                    final_message: message,
                }),
            ],
        }
    }

    pub fn tool_calls(calls: Vec<(&str, &str, Value)>) -> Self {
        let content = calls
            .into_iter()
            .map(|(id, name, args)| ContentBlock::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.as_object().cloned().unwrap_or_default(),
            })
            .collect();
        let message = assistant_message(content, StopReason::ToolUse);
        Self {
            events: vec![
                Ok(ProviderEvent::Start { message: message.clone() }),
                Ok(ProviderEvent::Done {
                    stop_reason: StopReason::ToolUse,
                    final_message: message,
                }),
            ],
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            events: vec![Err(anyhow::anyhow!(reason.into()))],
        }
    }
}

fn assistant_message(content: Vec<ContentBlock>, stop_reason: StopReason) -> Message {
    Message::Assistant {
        content,
        stop_reason,
        error_message: None,
        usage: None,
        model: "test-model".to_string(),
        provider: "test".to_string(),
        api: "test-api".to_string(),
        timestamp: chrono::Utc::now(),
    }
}

/// Builds a `stream_fn` that replays `turns` in order, one per call. A call
/// past the end of the script yields a final `stop` turn so a misbehaving
/// test that over-calls doesn't hang.
pub fn scripted_stream_fn(turns: Vec<ScriptedTurn>) -> StreamFn {
    let queue = Arc::new(Mutex::new(VecDeque::from(turns)));
    Arc::new(move |_model: &str, _messages: &[Message], _options: &StreamOptions| {
        let queue = queue.clone();
        Box::pin(async move {
            let turn = queue.lock().unwrap().pop_front().unwrap_or_else(|| ScriptedTurn::text("(script exhausted)"));
            let s: ProviderStream = Box::pin(stream::iter(turn.events));
            Ok(s)
        })
    })
}

/// A tool that returns `text` back immediately.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its text argument"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }
    async fn execute(&self, _call_id: &str, arguments: &Map<String, Value>, _abort: AbortSignal, _on_update: OnUpdate) -> anyhow::Result<ToolResult> {
        let text = arguments.get("text").and_then(Value::as_str).unwrap_or("").to_string();
        Ok(ToolResult::text(text))
    }
}

/// A tool that sleeps `delay` before returning, checking the abort signal
/// every 10ms so cancellation tests don't need to wait out the full delay.
pub struct SlowTool {
    pub delay: Duration,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "sleeps before returning"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _call_id: &str, _arguments: &Map<String, Value>, abort: AbortSignal, _on_update: OnUpdate) -> anyhow::Result<ToolResult> {
        let mut remaining = self.delay;
        let step = Duration::from_millis(10);
        while !remaining.is_zero() {
            if agent_tools::is_aborted(Some(&abort)) {
                return Ok(ToolResult::text("slow tool saw abort"));
            }
            let sleep_for = step.min(remaining);
            tokio::time::sleep(sleep_for).await;
            remaining = remaining.saturating_sub(sleep_for);
        }
        Ok(ToolResult::text("slow tool done"))
    }
}

/// Drains every event off `stream` into a `Vec`.
pub async fn collect_all(stream: &agent_core::EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    let consumer = stream.events();
    while let Some(event) = consumer.next().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}
