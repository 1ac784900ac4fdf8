// SPDX-License-Identifier: Apache-2.0
//! Runtime core of a streaming, tool-using AI agent: a bounded event-stream
//! broker, the multi-turn loop that drives a model and its tools, and the
//! long-lived actor that owns a conversation.
//!
//! Tool *implementations* and the language-model transport live outside
//! this crate — see [`agent_tools::Tool`] and [`config::StreamFn`].

pub mod agent;
pub mod config;
pub mod event;
pub mod event_stream;
pub mod loop_;
pub mod message;

pub use agent::{Agent, AgentError, AgentOptions, AgentSnapshot, QueueMode};
pub use agent_tools::{AbortSignal, Tool, ToolCall, ToolContent, ToolRegistry, ToolResult, Trust};
pub use config::{ConvertToLlm, GetApiKey, LoopConfig, QueueSource, StreamFn, StreamOptions, ThinkingLevel, TransformContext};
pub use event::Event;
pub use event_stream::{DropStrategy, EventConsumer, EventStream, EventStreamConfig, PushError, ResultOutcome, Stats};
pub use loop_::{agent_loop, agent_loop_continue, ProviderEvent, ProviderStream};
pub use message::{ContentBlock, Context, Message, StopReason, Usage};
