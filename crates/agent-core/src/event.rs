// SPDX-License-Identifier: Apache-2.0
//! Normalized events produced by `Loop` and consumed by subscribers.

use agent_tools::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::Message;

/// One normalized event in a run. `agent_end`, `error`, and `canceled` are
/// terminal — at most one of them is ever produced per run, and it is always
/// the last event any consumer sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentStart,
    AgentEnd { messages: Vec<Message> },
    TurnStart,
    TurnEnd {
        message: Message,
        tool_results: Vec<Message>,
    },
    MessageStart { message: Message },
    /// `provider_event` is the raw, opaque upstream event forwarded as-is —
    /// the loop normalizes the envelope, not the payload.
    MessageUpdate {
        message: Message,
        provider_event: Value,
    },
    MessageEnd { message: Message },
    ToolExecutionStart {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolExecutionUpdate {
        id: String,
        name: String,
        arguments: Map<String, Value>,
        partial_result: ToolResult,
    },
    ToolExecutionEnd {
        id: String,
        name: String,
        result: ToolResult,
        is_error: bool,
    },
    /// Terminal. `partial_state` carries whatever partial progress existed
    /// when the error surfaced (e.g. a half-streamed assistant message).
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_state: Option<Value>,
    },
    /// Terminal.
    Canceled { reason: String },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::AgentEnd { .. } | Event::Error { .. } | Event::Canceled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_end_is_terminal() {
        assert!(Event::AgentEnd { messages: vec![] }.is_terminal());
    }

    #[test]
    fn error_is_terminal() {
        assert!(Event::Error {
            reason: "boom".into(),
            partial_state: None
        }
        .is_terminal());
    }

    #[test]
    fn canceled_is_terminal() {
        assert!(Event::Canceled { reason: "x".into() }.is_terminal());
    }

    #[test]
    fn turn_start_is_not_terminal() {
        assert!(!Event::TurnStart.is_terminal());
    }

    #[test]
    fn message_update_is_not_terminal() {
        let message = Message::user("hi");
        assert!(!Event::MessageUpdate {
            message,
            provider_event: Value::Null
        }
        .is_terminal());
    }
}
