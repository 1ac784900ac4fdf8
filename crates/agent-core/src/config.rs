// SPDX-License-Identifier: Apache-2.0
//! Options bags and injectable hooks shared by `Loop` and `Agent`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::loop_::ProviderStream;
use crate::message::Message;

/// Extended-thinking effort level, forwarded to the provider untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Per-call options forwarded to `stream_fn`. Mirrors the recognized
/// `stream_options` keys.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub session_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: HashMap<ThinkingLevel, u32>,
    pub stream_timeout: Duration,
    pub tool_choice: Option<String>,
}

impl StreamOptions {
    pub fn with_defaults() -> Self {
        Self {
            stream_timeout: Duration::from_millis(300_000),
            ..Default::default()
        }
    }
}

/// `(model, llm_messages, stream_options) -> upstream event stream`. Owned by
/// the embedder; this crate never constructs one itself.
pub type StreamFn = Arc<
    dyn Fn(&str, &[Message], &StreamOptions) -> Pin<Box<dyn Future<Output = anyhow::Result<ProviderStream>> + Send>>
        + Send
        + Sync,
>;

/// Reshapes the agent's message log into whatever the backend needs to see.
/// Defaults to identity (clone).
pub type ConvertToLlm = Arc<dyn Fn(&[Message]) -> anyhow::Result<Vec<Message>> + Send + Sync>;

/// Truncates or summarizes history before it's sent upstream. Defaults to
/// identity (clone). Any error propagates unchanged into a terminal
/// `Event::Error`.
pub type TransformContext =
    Arc<dyn Fn(&[Message], Option<&agent_tools::AbortSignal>) -> anyhow::Result<Vec<Message>> + Send + Sync>;

/// Resolves a provider-scoped API key, tried before falling back to
/// `stream_options.api_key`.
pub type GetApiKey = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn identity_convert_to_llm() -> ConvertToLlm {
    Arc::new(|messages| Ok(messages.to_vec()))
}

pub fn identity_transform_context() -> TransformContext {
    Arc::new(|messages, _abort| Ok(messages.to_vec()))
}

pub fn no_api_key() -> GetApiKey {
    Arc::new(|_provider| None)
}

/// The Loop's dial into the Agent's steering/follow-up queues. Implemented
/// by `Agent`; standalone `agent_loop`/`agent_loop_continue` callers that
/// don't need mid-run intervention can omit it entirely.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Non-consuming check used to decide whether not-yet-started tool
    /// calls should be skipped.
    async fn has_steering_messages(&self) -> bool;
    /// Drains the steering queue per its current consumption mode.
    async fn get_steering_messages(&self) -> Vec<Message>;
    /// Drains the follow-up queue per its current consumption mode, or
    /// long-polls briefly for a new arrival. `abort_ref` lets the Agent
    /// recognize and ignore a call from a run it has already moved past.
    async fn get_follow_up_messages(&self, abort_ref: u64) -> Vec<Message>;
}

/// Configuration for one `agent_loop`/`agent_loop_continue` invocation.
#[derive(Clone)]
pub struct LoopConfig {
    pub model: String,
    pub provider: String,
    pub api: String,
    pub max_tool_concurrency: Option<usize>,
    pub convert_to_llm: ConvertToLlm,
    pub transform_context: TransformContext,
    pub get_api_key: GetApiKey,
    pub stream_fn: StreamFn,
    pub stream_options: StreamOptions,
    pub queue_source: Option<Arc<dyn QueueSource>>,
    pub abort_ref: u64,
    pub tool_tick: Duration,
    pub follow_up_poll: Duration,
}

impl LoopConfig {
    pub fn new(model: impl Into<String>, provider: impl Into<String>, api: impl Into<String>, stream_fn: StreamFn) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            api: api.into(),
            max_tool_concurrency: None,
            convert_to_llm: identity_convert_to_llm(),
            transform_context: identity_transform_context(),
            get_api_key: no_api_key(),
            stream_fn,
            stream_options: StreamOptions::with_defaults(),
            queue_source: None,
            abort_ref: 0,
            tool_tick: Duration::from_millis(100),
            follow_up_poll: Duration::from_millis(50),
        }
    }
}
