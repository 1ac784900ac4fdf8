// SPDX-License-Identifier: Apache-2.0
//! The long-lived stateful actor owning one conversation. A dedicated
//! `tokio::task` serializes every mutation and read through an mpsc mailbox
//! so readers always observe a consistent snapshot and no other task ever
//! touches `AgentState` directly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agent_tools::{AbortSignal, ToolRegistry};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{ConvertToLlm, GetApiKey, LoopConfig, QueueSource, StreamFn, StreamOptions, ThinkingLevel, TransformContext};
use crate::event::Event;
use crate::event_stream::EventStream;
use crate::loop_::{agent_loop, agent_loop_continue};
use crate::message::{Context, Message};

/// Whether a queue is drained one message at a time or all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    OneAtATime,
    All,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("a run is already streaming")]
    AlreadyStreaming,
    #[error("no messages to continue from")]
    NoMessages,
    #[error("the last message is not user or tool_result")]
    CannotContinue,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("timed out")]
    Timeout,
}

/// Construction options, mirroring the options bag accepted by an embedder.
pub struct AgentOptions {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub model: String,
    pub provider: String,
    pub api: String,
    pub thinking_level: ThinkingLevel,
    pub tools: ToolRegistry,
    pub convert_to_llm: ConvertToLlm,
    pub transform_context: TransformContext,
    pub get_api_key: GetApiKey,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub session_id: Option<String>,
    pub queue_call_timeout: Duration,
    pub stream_options: StreamOptions,
    pub stream_fn: StreamFn,
    pub max_tool_concurrency: Option<usize>,
}

impl AgentOptions {
    pub fn new(model: impl Into<String>, provider: impl Into<String>, api: impl Into<String>, stream_fn: StreamFn) -> Self {
        Self {
            name: None,
            system_prompt: None,
            model: model.into(),
            provider: provider.into(),
            api: api.into(),
            thinking_level: ThinkingLevel::default(),
            tools: ToolRegistry::default(),
            convert_to_llm: crate::config::identity_convert_to_llm(),
            transform_context: crate::config::identity_transform_context(),
            get_api_key: crate::config::no_api_key(),
            steering_mode: QueueMode::OneAtATime,
            follow_up_mode: QueueMode::All,
            session_id: None,
            queue_call_timeout: Duration::from_secs(30 * 60),
            stream_options: StreamOptions::with_defaults(),
            stream_fn,
            max_tool_concurrency: None,
        }
    }
}

/// An immutable point-in-time copy of `AgentState`, returned by `get_state`.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub system_prompt: Option<String>,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub stream_message: Option<Message>,
    pub pending_tool_calls: HashSet<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

struct AgentState {
    name: Option<String>,
    system_prompt: Option<String>,
    model: String,
    provider: String,
    api: String,
    thinking_level: ThinkingLevel,
    tools: ToolRegistry,
    convert_to_llm: ConvertToLlm,
    transform_context: TransformContext,
    get_api_key: GetApiKey,
    session_id: Option<String>,
    /// Configured but not independently enforced: the mailbox is bounded and
    /// every handler reply is a single cheap state mutation, so the only
    /// realistic caller-visible wait is `wait_for_idle`, which already takes
    /// its own deadline.
    #[allow(dead_code)]
    queue_call_timeout: Duration,
    stream_options: StreamOptions,
    stream_fn: StreamFn,
    max_tool_concurrency: Option<usize>,

    messages: Vec<Message>,
    steering_queue: Vec<Message>,
    follow_up_queue: Vec<Message>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,

    is_streaming: bool,
    stream_message: Option<Message>,
    pending_tool_calls: HashSet<String>,
    error: Option<String>,

    subscribers: Vec<mpsc::Sender<Event>>,
    idle_waiters: Vec<oneshot::Sender<()>>,

    current_abort: Option<AbortSignal>,
    abort_generation: u64,
    follow_up_waiter: Option<(u64, oneshot::Sender<Vec<Message>>)>,
    /// Set to the live generation by `reset()` while a run is still
    /// streaming — that run's terminal `AgentEnd`/`Error`/`Canceled`
    /// bookkeeping is discarded (but still clears `is_streaming`) so the
    /// freshly-cleared state it raced against doesn't get overwritten.
    reset_generation: Option<u64>,
}

impl AgentState {
    fn is_idle(&self) -> bool {
        !self.is_streaming
    }

    fn drain_queue(queue: &mut Vec<Message>, mode: QueueMode) -> Vec<Message> {
        match mode {
            QueueMode::All => std::mem::take(queue),
            QueueMode::OneAtATime => {
                if queue.is_empty() {
                    Vec::new()
                } else {
                    vec![queue.remove(0)]
                }
            }
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            system_prompt: self.system_prompt.clone(),
            model: self.model.clone(),
            thinking_level: self.thinking_level,
            messages: self.messages.clone(),
            is_streaming: self.is_streaming,
            stream_message: self.stream_message.clone(),
            pending_tool_calls: self.pending_tool_calls.clone(),
            error: self.error.clone(),
            session_id: self.session_id.clone(),
        }
    }

    fn fanout(&mut self, event: &Event) {
        self.subscribers.retain(|sub| sub.try_send(event.clone()).is_ok());
    }

    fn go_idle(&mut self) {
        self.is_streaming = false;
        self.current_abort = None;
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Bookkeeping sink described in §4.4 — updates derived state from an
    /// event the relay task observed, then fans it out to subscribers.
    /// `stale` marks an event from a generation that `reset()` already
    /// discarded: the terminal outcome still flips the run idle, but must
    /// not repopulate `messages`/`error` with that run's transcript.
    fn observe(&mut self, event: Event, stale: bool) {
        match &event {
            Event::ToolExecutionStart { id, .. } => {
                self.pending_tool_calls.insert(id.clone());
            }
            Event::ToolExecutionEnd { id, .. } => {
                self.pending_tool_calls.remove(id);
            }
            Event::MessageStart { message } | Event::MessageUpdate { message, .. } | Event::MessageEnd { message } => {
                self.stream_message = Some(message.clone());
            }
            Event::Error { reason, .. } => {
                if !stale {
                    self.error = Some(reason.clone());
                }
                self.go_idle();
            }
            Event::Canceled { reason } => {
                if !stale {
                    self.error = Some(reason.clone());
                }
                self.go_idle();
            }
            Event::AgentEnd { messages } => {
                if !stale {
                    self.messages = messages.clone();
                }
                self.go_idle();
            }
            _ => {}
        }
        self.fanout(&event);
    }
}

enum Command {
    SetSystemPrompt(Option<String>, oneshot::Sender<()>),
    SetModel(String, oneshot::Sender<()>),
    SetThinkingLevel(ThinkingLevel, oneshot::Sender<()>),
    SetTools(ToolRegistry, oneshot::Sender<()>),
    SetSessionId(Option<String>, oneshot::Sender<()>),
    SetSteeringMode(QueueMode, oneshot::Sender<()>),
    SetFollowUpMode(QueueMode, oneshot::Sender<()>),
    GetSystemPrompt(oneshot::Sender<Option<String>>),
    GetModel(oneshot::Sender<String>),
    GetThinkingLevel(oneshot::Sender<ThinkingLevel>),
    GetSessionId(oneshot::Sender<Option<String>>),
    GetSteeringMode(oneshot::Sender<QueueMode>),
    GetFollowUpMode(oneshot::Sender<QueueMode>),
    GetState(oneshot::Sender<AgentSnapshot>),

    ReplaceMessages(Vec<Message>, oneshot::Sender<()>),
    AppendMessage(Message, oneshot::Sender<()>),

    Steer(Message),
    FollowUp(Message),
    ClearSteeringQueue,
    ClearFollowUpQueue,
    ClearAllQueues,

    Subscribe(mpsc::Sender<Event>, oneshot::Sender<()>),

    Prompt(Vec<Message>, oneshot::Sender<Result<(), AgentError>>),
    Continue(oneshot::Sender<Result<(), AgentError>>),
    Abort(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
    WaitForIdle(Option<Duration>, oneshot::Sender<Result<(), AgentError>>),

    HasSteeringMessages(oneshot::Sender<bool>),
    DrainSteeringMessages(oneshot::Sender<Vec<Message>>),
    DrainFollowUpMessages(u64, oneshot::Sender<Vec<Message>>),
    FollowUpTimeout(u64),

    LoopEvent(u64, Event),
}

/// A cheap, cloneable handle to a running `Agent` actor.
#[derive(Clone)]
pub struct Agent {
    tx: mpsc::Sender<Command>,
}

impl Agent {
    pub fn spawn(options: AgentOptions) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let handle = Agent { tx };
        let state = AgentState {
            name: options.name,
            system_prompt: options.system_prompt,
            model: options.model,
            provider: options.provider,
            api: options.api,
            thinking_level: options.thinking_level,
            tools: options.tools,
            convert_to_llm: options.convert_to_llm,
            transform_context: options.transform_context,
            get_api_key: options.get_api_key,
            session_id: options.session_id,
            queue_call_timeout: options.queue_call_timeout,
            stream_options: options.stream_options,
            stream_fn: options.stream_fn,
            max_tool_concurrency: options.max_tool_concurrency,
            messages: Vec::new(),
            steering_queue: Vec::new(),
            follow_up_queue: Vec::new(),
            steering_mode: options.steering_mode,
            follow_up_mode: options.follow_up_mode,
            is_streaming: false,
            stream_message: None,
            pending_tool_calls: HashSet::new(),
            error: None,
            subscribers: Vec::new(),
            idle_waiters: Vec::new(),
            current_abort: None,
            abort_generation: 0,
            follow_up_waiter: None,
            reset_generation: None,
        };
        let actor_handle = handle.clone();
        tokio::spawn(run_actor(state, rx, actor_handle));
        handle
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(build(tx)).await;
        rx.await.expect("agent actor task must not die while a caller awaits a reply")
    }

    pub async fn set_system_prompt(&self, prompt: Option<String>) {
        self.call(|r| Command::SetSystemPrompt(prompt, r)).await
    }
    pub async fn set_model(&self, model: String) {
        self.call(|r| Command::SetModel(model, r)).await
    }
    pub async fn set_thinking_level(&self, level: ThinkingLevel) {
        self.call(|r| Command::SetThinkingLevel(level, r)).await
    }
    pub async fn set_tools(&self, tools: ToolRegistry) {
        self.call(|r| Command::SetTools(tools, r)).await
    }
    pub async fn set_session_id(&self, id: Option<String>) {
        self.call(|r| Command::SetSessionId(id, r)).await
    }
    pub async fn set_steering_mode(&self, mode: QueueMode) {
        self.call(|r| Command::SetSteeringMode(mode, r)).await
    }
    pub async fn set_follow_up_mode(&self, mode: QueueMode) {
        self.call(|r| Command::SetFollowUpMode(mode, r)).await
    }
    pub async fn system_prompt(&self) -> Option<String> {
        self.call(Command::GetSystemPrompt).await
    }
    pub async fn model(&self) -> String {
        self.call(Command::GetModel).await
    }
    pub async fn thinking_level(&self) -> ThinkingLevel {
        self.call(Command::GetThinkingLevel).await
    }
    pub async fn session_id(&self) -> Option<String> {
        self.call(Command::GetSessionId).await
    }
    pub async fn steering_mode(&self) -> QueueMode {
        self.call(Command::GetSteeringMode).await
    }
    pub async fn follow_up_mode(&self) -> QueueMode {
        self.call(Command::GetFollowUpMode).await
    }
    pub async fn get_state(&self) -> AgentSnapshot {
        self.call(Command::GetState).await
    }

    pub async fn replace_messages(&self, messages: Vec<Message>) {
        self.call(|r| Command::ReplaceMessages(messages, r)).await
    }
    pub async fn append_message(&self, message: Message) {
        self.call(|r| Command::AppendMessage(message, r)).await
    }

    pub async fn steer(&self, message: Message) {
        let _ = self.tx.send(Command::Steer(message)).await;
    }
    pub async fn follow_up(&self, message: Message) {
        let _ = self.tx.send(Command::FollowUp(message)).await;
    }
    pub async fn clear_steering_queue(&self) {
        let _ = self.tx.send(Command::ClearSteeringQueue).await;
    }
    pub async fn clear_follow_up_queue(&self) {
        let _ = self.tx.send(Command::ClearFollowUpQueue).await;
    }
    pub async fn clear_all_queues(&self) {
        let _ = self.tx.send(Command::ClearAllQueues).await;
    }

    /// Registers `sink` as an event subscriber. The Agent prunes it
    /// automatically the next time a delivery to it fails; this returned
    /// handle's `unsubscribe` is provided for symmetry with the source
    /// contract but dropping `sink`'s receiver has the same effect.
    pub async fn subscribe(&self, sink: mpsc::Sender<Event>) {
        self.call(|r| Command::Subscribe(sink, r)).await
    }

    pub async fn prompt(&self, messages: Vec<Message>) -> Result<(), AgentError> {
        self.call(|r| Command::Prompt(messages, r)).await
    }
    pub async fn continue_run(&self) -> Result<(), AgentError> {
        self.call(Command::Continue).await
    }
    pub async fn abort(&self) {
        self.call(Command::Abort).await
    }
    pub async fn reset(&self) {
        self.call(Command::Reset).await
    }
    pub async fn wait_for_idle(&self, timeout: Option<Duration>) -> Result<(), AgentError> {
        self.call(|r| Command::WaitForIdle(timeout, r)).await
    }
}

#[async_trait]
impl QueueSource for Agent {
    async fn has_steering_messages(&self) -> bool {
        self.call(Command::HasSteeringMessages).await
    }
    async fn get_steering_messages(&self) -> Vec<Message> {
        self.call(Command::DrainSteeringMessages).await
    }
    async fn get_follow_up_messages(&self, abort_ref: u64) -> Vec<Message> {
        self.call(|r| Command::DrainFollowUpMessages(abort_ref, r)).await
    }
}

async fn run_actor(mut state: AgentState, mut rx: mpsc::Receiver<Command>, handle: Agent) {
    tracing::debug!(name = ?state.name, "agent actor started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::SetSystemPrompt(v, r) => {
                state.system_prompt = v;
                let _ = r.send(());
            }
            Command::SetModel(v, r) => {
                state.model = v;
                let _ = r.send(());
            }
            Command::SetThinkingLevel(v, r) => {
                state.thinking_level = v;
                let _ = r.send(());
            }
            Command::SetTools(v, r) => {
                state.tools = v;
                let _ = r.send(());
            }
            Command::SetSessionId(v, r) => {
                state.session_id = v;
                let _ = r.send(());
            }
            Command::SetSteeringMode(v, r) => {
                state.steering_mode = v;
                let _ = r.send(());
            }
            Command::SetFollowUpMode(v, r) => {
                state.follow_up_mode = v;
                let _ = r.send(());
            }
            Command::GetSystemPrompt(r) => {
                let _ = r.send(state.system_prompt.clone());
            }
            Command::GetModel(r) => {
                let _ = r.send(state.model.clone());
            }
            Command::GetThinkingLevel(r) => {
                let _ = r.send(state.thinking_level);
            }
            Command::GetSessionId(r) => {
                let _ = r.send(state.session_id.clone());
            }
            Command::GetSteeringMode(r) => {
                let _ = r.send(state.steering_mode);
            }
            Command::GetFollowUpMode(r) => {
                let _ = r.send(state.follow_up_mode);
            }
            Command::GetState(r) => {
                let _ = r.send(state.snapshot());
            }

            Command::ReplaceMessages(messages, r) => {
                state.messages = messages;
                let _ = r.send(());
            }
            Command::AppendMessage(message, r) => {
                state.messages.push(message);
                let _ = r.send(());
            }

            Command::Steer(message) => {
                state.steering_queue.push(message);
            }
            Command::FollowUp(message) => {
                if let Some((_, waiter)) = state.follow_up_waiter.take() {
                    state.follow_up_queue.push(message);
                    let drained = AgentState::drain_queue(&mut state.follow_up_queue, state.follow_up_mode);
                    let _ = waiter.send(drained);
                } else {
                    state.follow_up_queue.push(message);
                }
            }
            Command::ClearSteeringQueue => state.steering_queue.clear(),
            Command::ClearFollowUpQueue => state.follow_up_queue.clear(),
            Command::ClearAllQueues => {
                state.steering_queue.clear();
                state.follow_up_queue.clear();
            }

            Command::Subscribe(sink, r) => {
                state.subscribers.push(sink);
                let _ = r.send(());
            }

            Command::Prompt(prompts, r) => {
                if state.is_streaming {
                    let _ = r.send(Err(AgentError::AlreadyStreaming));
                    continue;
                }
                let messages = if prompts.is_empty() {
                    vec![]
                } else {
                    prompts
                };
                let context = Context::new(state.system_prompt.clone(), state.tools.clone());
                start_run(&mut state, &handle, context, Some(messages), false);
                let _ = r.send(Ok(()));
            }
            Command::Continue(r) => {
                if state.is_streaming {
                    let _ = r.send(Err(AgentError::AlreadyStreaming));
                    continue;
                }
                if state.messages.is_empty() {
                    let _ = r.send(Err(AgentError::NoMessages));
                    continue;
                }
                if !state.messages.last().map(Message::can_continue_from).unwrap_or(false) {
                    let _ = r.send(Err(AgentError::CannotContinue));
                    continue;
                }
                let mut context = Context::new(state.system_prompt.clone(), state.tools.clone());
                context.messages = state.messages.clone();
                start_run(&mut state, &handle, context, None, true);
                let _ = r.send(Ok(()));
            }
            Command::Abort(r) => {
                if let Some(sig) = &state.current_abort {
                    sig.abort();
                }
                let _ = r.send(());
            }
            Command::Reset(r) => {
                if state.is_streaming {
                    if let Some(sig) = &state.current_abort {
                        sig.abort();
                    }
                    state.reset_generation = Some(state.abort_generation);
                }
                state.messages.clear();
                state.error = None;
                state.steering_queue.clear();
                state.follow_up_queue.clear();
                state.stream_message = None;
                let _ = r.send(());
            }
            Command::WaitForIdle(timeout, r) => {
                if state.is_idle() {
                    let _ = r.send(Ok(()));
                    continue;
                }
                let (waiter_tx, waiter_rx) = oneshot::channel();
                state.idle_waiters.push(waiter_tx);
                tokio::spawn(async move {
                    let result = match timeout {
                        Some(d) => match tokio::time::timeout(d, waiter_rx).await {
                            Ok(_) => Ok(()),
                            Err(_) => Err(AgentError::Timeout),
                        },
                        None => waiter_rx.await.map(|_| ()).map_err(|_| AgentError::Timeout),
                    };
                    let _ = r.send(result);
                });
            }

            Command::HasSteeringMessages(r) => {
                let _ = r.send(!state.steering_queue.is_empty());
            }
            Command::DrainSteeringMessages(r) => {
                let drained = AgentState::drain_queue(&mut state.steering_queue, state.steering_mode);
                let _ = r.send(drained);
            }
            Command::DrainFollowUpMessages(abort_ref, r) => {
                if abort_ref != state.abort_generation {
                    let _ = r.send(Vec::new());
                    continue;
                }
                if !state.follow_up_queue.is_empty() {
                    let drained = AgentState::drain_queue(&mut state.follow_up_queue, state.follow_up_mode);
                    let _ = r.send(drained);
                    continue;
                }
                state.follow_up_waiter = Some((abort_ref, r));
                let tx = handle.tx.clone();
                let generation = abort_ref;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx.send(Command::FollowUpTimeout(generation)).await;
                });
            }
            Command::FollowUpTimeout(generation) => {
                if let Some((gen, waiter)) = state.follow_up_waiter.take() {
                    if gen == generation {
                        let _ = waiter.send(Vec::new());
                    } else {
                        state.follow_up_waiter = Some((gen, waiter));
                    }
                }
            }

            Command::LoopEvent(generation, event) => {
                let stale = state.reset_generation == Some(generation);
                state.observe(event, stale);
            }
        }
    }
}

fn start_run(state: &mut AgentState, handle: &Agent, context: Context, prompts: Option<Vec<Message>>, is_continue: bool) {
    state.is_streaming = true;
    state.error = None;
    state.abort_generation += 1;
    let abort_ref = state.abort_generation;
    let abort = AbortSignal::new();
    state.current_abort = Some(abort.clone());
    state.follow_up_waiter = None;
    state.reset_generation = None;

    let config = LoopConfig {
        model: state.model.clone(),
        provider: state.provider.clone(),
        api: state.api.clone(),
        max_tool_concurrency: state.max_tool_concurrency,
        convert_to_llm: state.convert_to_llm.clone(),
        transform_context: state.transform_context.clone(),
        get_api_key: state.get_api_key.clone(),
        stream_fn: state.stream_fn.clone(),
        stream_options: state.stream_options.clone(),
        queue_source: Some(Arc::new(handle.clone())),
        abort_ref,
        tool_tick: Duration::from_millis(100),
        follow_up_poll: Duration::from_millis(50),
    };

    let stream = if is_continue {
        agent_loop_continue(context, config, Some(abort), None)
    } else {
        agent_loop(prompts.unwrap_or_default(), context, config, Some(abort), None)
    };

    let relay_tx = handle.tx.clone();
    tokio::spawn(async move {
        let consumer = stream.events();
        loop {
            match consumer.next().await {
                Some(event) => {
                    let terminal = event.is_terminal();
                    if relay_tx.send(Command::LoopEvent(abort_ref, event)).await.is_err() {
                        warn!("agent actor gone; dropping remaining loop events");
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
                None => return,
            }
        }
    });
}
