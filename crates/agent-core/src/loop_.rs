// SPDX-License-Identifier: Apache-2.0
//! The turn-driving loop: calls `stream_fn`, relays its events, dispatches
//! tool calls in parallel, and consults the steering/follow-up queues
//! between turns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use agent_tools::{is_aborted, AbortSignal, ToolResult};
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LoopConfig;
use crate::event::Event;
use crate::event_stream::{EventStream, EventStreamConfig};
use crate::message::{ContentBlock, Context, Message, StopReason};

/// Upstream event yielded by a `stream_fn` implementation. The relay treats
/// every variant except `Done`/`Error` as an opaque delta forwarded
/// verbatim as `message_update`'s `provider_event` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    Start { message: Message },
    TextStart,
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, partial_arguments: String },
    ToolCallEnd { id: String },
    TextEnd,
    Other(Value),
    Done {
        stop_reason: StopReason,
        final_message: Message,
    },
    Error {
        reason: String,
        partial_message: Option<Message>,
    },
}

impl ProviderEvent {
    fn is_terminator(&self) -> bool {
        matches!(self, ProviderEvent::Done { .. } | ProviderEvent::Error { .. })
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// Outcome of running the relay phase of one turn.
enum TurnOutcome {
    /// The assistant message finished normally (possibly with tool calls).
    Finished { message: Message, stop_reason: StopReason },
    /// The whole run ended here — a terminal event has already been
    /// published to `output`.
    Terminated,
}

/// Starts a fresh sequence from caller-supplied prompt messages. Returns
/// immediately; the run happens on a spawned task attached to the returned
/// stream, so the task's death (panic) is itself a fatal stream error.
pub fn agent_loop(
    prompts: Vec<Message>,
    context: Context,
    config: LoopConfig,
    abort: Option<AbortSignal>,
    owner: Option<JoinHandle<()>>,
) -> EventStream {
    spawn_run(context, config, abort, owner, prompts)
}

/// Resumes from an existing context whose last message must be `user` or
/// `tool_result`. Returns an already-terminated stream with reason
/// `cannot_continue` if that precondition fails.
pub fn agent_loop_continue(
    context: Context,
    config: LoopConfig,
    abort: Option<AbortSignal>,
    owner: Option<JoinHandle<()>>,
) -> EventStream {
    let can_continue = context.messages.last().map(Message::can_continue_from).unwrap_or(false);
    if !can_continue {
        let stream = EventStream::new(EventStreamConfig::default());
        stream.push_async(Event::AgentStart);
        stream.error("cannot_continue", None);
        return stream;
    }
    spawn_run(context, config, abort, owner, Vec::new())
}

fn spawn_run(context: Context, config: LoopConfig, abort: Option<AbortSignal>, owner: Option<JoinHandle<()>>, pending: Vec<Message>) -> EventStream {
    let stream = EventStream::with_owner(EventStreamConfig::default(), owner);
    let output = stream.clone();
    let handle = tokio::spawn(async move {
        run(context, config, abort, output, pending).await;
    });
    stream.attach_task(handle);
    stream
}

/// Emits `message_start`/`message_end` for each not-yet-appended message and
/// appends it to `context` — used for the initial prompt(s) and for
/// steering/follow-up messages injected ahead of a new turn.
fn announce_and_append(context: &mut Context, output: &EventStream, pending: Vec<Message>) {
    for message in pending {
        output.push_async(Event::MessageStart { message: message.clone() });
        output.push_async(Event::MessageEnd { message: message.clone() });
        context.push(message);
    }
}

async fn run(mut context: Context, config: LoopConfig, abort: Option<AbortSignal>, output: EventStream, mut pending: Vec<Message>) {
    output.push_async(Event::AgentStart);

    loop {
        if is_aborted(abort.as_ref()) {
            output.complete(context.messages.clone());
            return;
        }

        output.push_async(Event::TurnStart);
        announce_and_append(&mut context, &output, std::mem::take(&mut pending));

        let outcome = match run_turn(&mut context, &config, abort.as_ref(), &output).await {
            Some(outcome) => outcome,
            None => return, // terminal event already published
        };

        let TurnOutcome::Finished { message, stop_reason } = outcome else {
            return;
        };

        if matches!(stop_reason, StopReason::Aborted | StopReason::Error) {
            output.push_async(Event::TurnEnd {
                message: message.clone(),
                tool_results: vec![],
            });
            output.complete(context.messages.clone());
            return;
        }

        let tool_calls: Vec<(String, String, serde_json::Map<String, Value>)> = match &message {
            Message::Assistant { content, .. } => content
                .iter()
                .filter_map(|c| match c {
                    ContentBlock::ToolCall { id, name, arguments } => Some((id.clone(), name.clone(), arguments.clone())),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        };

        if !tool_calls.is_empty() {
            let tool_result_messages = run_tool_calls(&mut context, &config, abort.as_ref(), &output, &tool_calls).await;
            output.push_async(Event::TurnEnd {
                message: message.clone(),
                tool_results: tool_result_messages,
            });
            continue;
        }

        // Plain text stop: steering first, then a short follow-up long-poll.
        if let Some(queue) = &config.queue_source {
            let steering = queue.get_steering_messages().await;
            if !steering.is_empty() {
                output.push_async(Event::TurnEnd {
                    message: message.clone(),
                    tool_results: vec![],
                });
                pending = steering;
                continue;
            }

            let follow_up = queue.get_follow_up_messages(config.abort_ref).await;
            if !follow_up.is_empty() {
                output.push_async(Event::TurnEnd {
                    message: message.clone(),
                    tool_results: vec![],
                });
                pending = follow_up;
                continue;
            }
        }

        output.push_async(Event::TurnEnd {
            message: message.clone(),
            tool_results: vec![],
        });
        output.complete(context.messages.clone());
        return;
    }
}

/// Runs the pre-flight + stream phases of one turn. `None` means a terminal
/// event has already been published and the caller should stop.
async fn run_turn(
    context: &mut Context,
    config: &LoopConfig,
    abort: Option<&AbortSignal>,
    output: &EventStream,
) -> Option<TurnOutcome> {
    let transformed = match (config.transform_context)(context.chronological(), abort) {
        Ok(messages) => messages,
        Err(e) => {
            output.error(&e.to_string(), None);
            return None;
        }
    };

    let llm_messages = match (config.convert_to_llm)(&transformed) {
        Ok(messages) => messages,
        Err(e) => {
            output.error(&e.to_string(), None);
            return None;
        }
    };

    let mut stream_options = config.stream_options.clone();
    if stream_options.api_key.is_none() {
        stream_options.api_key = (config.get_api_key)(&config.provider);
    }

    let provider_stream = match (config.stream_fn)(&config.model, &llm_messages, &stream_options).await {
        Ok(stream) => stream,
        Err(e) => {
            output.error(&e.to_string(), None);
            return None;
        }
    };

    relay(provider_stream, abort, output, context).await
}

/// Consumes the upstream stream, emitting normalized `message_*` events and
/// returning the finalized assistant message, or `None` if a terminal event
/// was already published (abort mid-stream, upstream error, or a stream
/// that closed without a terminator).
async fn relay(
    mut provider_stream: ProviderStream,
    abort: Option<&AbortSignal>,
    output: &EventStream,
    context: &mut Context,
) -> Option<TurnOutcome> {
    let mut current: Option<Message> = None;

    loop {
        if is_aborted(abort) {
            let aborted = finalize_aborted(current.take());
            output.push_async(Event::MessageEnd { message: aborted.clone() });
            context.push(aborted.clone());
            return Some(TurnOutcome::Finished {
                message: aborted,
                stop_reason: StopReason::Aborted,
            });
        }

        let event = match provider_stream.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                output.error(&e.to_string(), None);
                return None;
            }
            None => {
                output.error("stream_ended_without_terminator", None);
                return None;
            }
        };

        match event {
            ProviderEvent::Start { message } => {
                output.push_async(Event::MessageStart { message: message.clone() });
                current = Some(message);
            }
            ProviderEvent::Done { stop_reason, final_message } => {
                output.push_async(Event::MessageEnd {
                    message: final_message.clone(),
                });
                context.push(final_message.clone());
                return Some(TurnOutcome::Finished {
                    message: final_message,
                    stop_reason,
                });
            }
            ProviderEvent::Error { reason, partial_message } => {
                if let Some(partial) = &partial_message {
                    output.push_async(Event::MessageEnd { message: partial.clone() });
                }
                let partial = partial_message.and_then(|m| serde_json::to_value(m).ok());
                output.error(&reason, partial);
                return None;
            }
            other => {
                let provider_event = serde_json::to_value(&other).unwrap_or(Value::Null);
                if let Some(message) = &current {
                    output.push_async(Event::MessageUpdate {
                        message: message.clone(),
                        provider_event,
                    });
                }
            }
        }
    }
}

fn finalize_aborted(current: Option<Message>) -> Message {
    match current {
        Some(Message::Assistant {
            content,
            model,
            provider,
            api,
            usage,
            ..
        }) => Message::Assistant {
            content,
            stop_reason: StopReason::Aborted,
            error_message: Some("canceled".to_string()),
            usage,
            model,
            provider,
            api,
            timestamp: chrono::Utc::now(),
        },
        _ => Message::Assistant {
            content: vec![],
            stop_reason: StopReason::Aborted,
            error_message: Some("canceled".to_string()),
            usage: None,
            model: String::new(),
            provider: String::new(),
            api: String::new(),
            timestamp: chrono::Utc::now(),
        },
    }
}

/// Normalizes a tool task's raw return into `(ToolResult, is_error)`.
fn normalize_tool_return(result: anyhow::Result<ToolResult>) -> (ToolResult, bool) {
    match result {
        Ok(r) => {
            let is_error = false;
            (r, is_error)
        }
        Err(e) => (ToolResult::text(e.to_string()), true),
    }
}

fn aborted_tool_result() -> ToolResult {
    ToolResult::text("Aborted").with_details(json!({"error_type": "aborted"}))
}

fn skipped_tool_result() -> ToolResult {
    ToolResult::text("Skipped due to queued user message.")
}

/// Executes `tool_calls` in parallel on supervised tasks, honoring
/// steering-preempts-fan-out and abort-mid-collection. Returns the
/// `ToolResult` messages in the tool calls' original order, already
/// appended to `context`.
async fn run_tool_calls(
    context: &mut Context,
    config: &LoopConfig,
    abort: Option<&AbortSignal>,
    output: &EventStream,
    tool_calls: &[(String, String, serde_json::Map<String, Value>)],
) -> Vec<Message> {
    let mut results: Vec<Option<(ToolResult, bool)>> = vec![None; tool_calls.len()];
    let permits = config.max_tool_concurrency.map(|n| std::sync::Arc::new(tokio::sync::Semaphore::new(n)));

    let mut in_flight = FuturesUnordered::new();
    let mut abort_handles: HashMap<usize, tokio::task::AbortHandle> = HashMap::new();
    let mut preempted = false;

    for (idx, (call_id, name, arguments)) in tool_calls.iter().enumerate() {
        if !preempted {
            if let Some(queue) = &config.queue_source {
                if queue.has_steering_messages().await {
                    preempted = true;
                }
            }
        }

        if preempted {
            let result = skipped_tool_result();
            output.push_async(Event::ToolExecutionEnd {
                id: call_id.clone(),
                name: name.clone(),
                result: result.clone(),
                is_error: true,
            });
            results[idx] = Some((result, true));
            continue;
        }

        output.push_async(Event::ToolExecutionStart {
            id: call_id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        });

        let Some(tool) = context.tool(name) else {
            results[idx] = Some((ToolResult::text(format!("tool not found: {name}")), true));
            output.push_async(Event::ToolExecutionEnd {
                id: call_id.clone(),
                name: name.clone(),
                result: results[idx].as_ref().unwrap().0.clone(),
                is_error: true,
            });
            continue;
        };

        let call_id = call_id.clone();
        let name_for_event = name.clone();
        let arguments = arguments.clone();
        let abort_signal = abort.cloned().unwrap_or_default();
        let output_for_update = output.clone();
        let call_id_for_update = call_id.clone();
        let name_for_update = name_for_event.clone();
        let arguments_for_update = arguments.clone();
        let on_update = agent_tools::on_update(move |partial| {
            let output = output_for_update.clone();
            let id = call_id_for_update.clone();
            let name = name_for_update.clone();
            let arguments = arguments_for_update.clone();
            async move {
                output.push_async(Event::ToolExecutionUpdate {
                    id,
                    name,
                    arguments,
                    partial_result: partial,
                });
            }
        });

        let permits = permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = match &permits {
                Some(sem) => Some(sem.acquire_owned().await.expect("semaphore never closed")),
                None => None,
            };
            tool.execute(&call_id, &arguments, abort_signal, on_update).await
        });
        abort_handles.insert(idx, handle.abort_handle());
        in_flight.push(async move { (idx, name_for_event, handle.await) });
    }

    loop {
        if in_flight.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            next = in_flight.next() => {
                let Some((idx, name, join_result)) = next else { break };
                abort_handles.remove(&idx);
                let (tool_result, is_error) = match join_result {
                    Ok(result) => normalize_tool_return(result),
                    Err(e) if e.is_cancelled() => (aborted_tool_result(), true),
                    Err(e) => (ToolResult::text(format!("tool panicked: {e}")), true),
                };
                let (call_id, _, _) = &tool_calls[idx];
                output.push_async(Event::ToolExecutionEnd {
                    id: call_id.clone(),
                    name,
                    result: tool_result.clone(),
                    is_error,
                });
                results[idx] = Some((tool_result, is_error));
            }
            _ = tokio::time::sleep(config.tool_tick) => {
                if is_aborted(abort) {
                    for (idx, handle) in abort_handles.drain() {
                        handle.abort();
                        let (call_id, name, _) = &tool_calls[idx];
                        let result = aborted_tool_result();
                        output.push_async(Event::ToolExecutionEnd {
                            id: call_id.clone(),
                            name: name.clone(),
                            result: result.clone(),
                            is_error: true,
                        });
                        results[idx] = Some((result, true));
                    }
                    break;
                }
                debug!(pending = in_flight.len(), "tool collection tick");
            }
        }
    }

    let mut messages = Vec::with_capacity(tool_calls.len());
    for (idx, (call_id, name, _)) in tool_calls.iter().enumerate() {
        let (result, is_error) = results[idx].take().unwrap_or_else(|| {
            warn!(call_id = %call_id, "tool call never completed; synthesizing aborted result");
            (aborted_tool_result(), true)
        });
        let message = if is_error {
            Message::tool_error(call_id, name, result.as_text())
        } else {
            Message::tool_result(call_id, name, &result)
        };
        output.push_async(Event::MessageStart { message: message.clone() });
        output.push_async(Event::MessageEnd { message: message.clone() });
        context.push(message.clone());
        messages.push(message);
    }
    messages
}
