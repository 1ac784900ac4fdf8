// SPDX-License-Identifier: Apache-2.0
//! The conversation data model: messages, content blocks, and the mutable
//! context (system prompt + message log + tools) a turn is run against.

use std::sync::Arc;

use agent_tools::{Tool, ToolRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Why an assistant turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

/// Token accounting reported by the provider for one assistant turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

/// One ordered piece of a message's content. A content list may freely mix
/// variants (e.g. a thinking block followed by text followed by a tool
/// call).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    Image { data: String, mime_type: String },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// The tagged-union message log entry. `role` is implicit in the variant so
/// an exhaustive match is all that's needed to handle every shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: Vec<ContentBlock>,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        content: Vec<ContentBlock>,
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        model: String,
        provider: String,
        api: String,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<agent_tools::ToolContent>,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            content: vec![ContentBlock::text(text)],
            timestamp: Utc::now(),
        }
    }

    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        Message::User {
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, tool_name: impl Into<String>, result: &agent_tools::ToolResult) -> Self {
        Message::ToolResult {
            tool_call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: result.content.clone(),
            is_error: false,
            details: result.details.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_error(call_id: impl Into<String>, tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Message::ToolResult {
            tool_call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: vec![agent_tools::ToolContent::text(message.into())],
            is_error: true,
            details: None,
            timestamp: Utc::now(),
        }
    }

    /// `true` for a message whose role can legally end a context that
    /// `agent_loop_continue` is allowed to resume from.
    pub fn can_continue_from(&self) -> bool {
        matches!(self, Message::User { .. } | Message::ToolResult { .. })
    }

    /// Every `ToolCall` id this message announces (empty for non-assistant
    /// messages or assistant messages with no tool calls).
    pub fn tool_call_ids(&self) -> Vec<String> {
        match self {
            Message::Assistant { content, .. } => content
                .iter()
                .filter_map(|c| match c {
                    ContentBlock::ToolCall { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The mutable state a turn runs against: the system prompt, the
/// chronological message log, and the set of tools available to the model.
///
/// Messages are stored chronologically. `prepend` is provided for callers
/// that need to splice steering/follow-up messages in ahead of an
/// in-progress turn without an O(n) shift of the whole log; it's a thin
/// wrapper so the common case (`push`, iterate in order) stays simple.
#[derive(Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: ToolRegistry,
}

impl Context {
    pub fn new(system_prompt: Option<String>, tools: ToolRegistry) -> Self {
        Self {
            system_prompt,
            messages: Vec::new(),
            tools,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn prepend(&mut self, messages: Vec<Message>) {
        let mut combined = messages;
        combined.extend(std::mem::take(&mut self.messages));
        self.messages = combined;
    }

    /// Read-only chronological view; exists alongside `messages` so callers
    /// that only ever want to iterate don't need to know about `prepend`'s
    /// splice semantics.
    pub fn chronological(&self) -> &[Message] {
        &self.messages
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_can_continue_from() {
        assert!(Message::user("hi").can_continue_from());
    }

    #[test]
    fn assistant_message_cannot_continue_from() {
        let msg = Message::Assistant {
            content: vec![ContentBlock::text("ok")],
            stop_reason: StopReason::Stop,
            error_message: None,
            usage: None,
            model: "m".into(),
            provider: "p".into(),
            api: "a".into(),
            timestamp: Utc::now(),
        };
        assert!(!msg.can_continue_from());
    }

    #[test]
    fn tool_result_can_continue_from() {
        let result = agent_tools::ToolResult::text("done");
        let msg = Message::tool_result("c1", "echo", &result);
        assert!(msg.can_continue_from());
    }

    #[test]
    fn tool_call_ids_extracted_from_assistant_message() {
        let msg = Message::Assistant {
            content: vec![
                ContentBlock::text("calling tools"),
                ContentBlock::ToolCall {
                    id: "c1".into(),
                    name: "echo".into(),
                    arguments: Map::new(),
                },
                ContentBlock::ToolCall {
                    id: "c2".into(),
                    name: "echo".into(),
                    arguments: Map::new(),
                },
            ],
            stop_reason: StopReason::ToolUse,
            error_message: None,
            usage: None,
            model: "m".into(),
            provider: "p".into(),
            api: "a".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(msg.tool_call_ids(), vec!["c1", "c2"]);
    }

    #[test]
    fn prepend_keeps_chronological_order() {
        let mut ctx = Context::default();
        ctx.push(Message::user("second"));
        ctx.prepend(vec![Message::user("first")]);
        let texts: Vec<_> = ctx
            .chronological()
            .iter()
            .map(|m| match m {
                Message::User { content, .. } => match &content[0] {
                    ContentBlock::Text { text } => text.clone(),
                    _ => String::new(),
                },
                _ => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }
}
