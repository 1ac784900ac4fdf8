// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::abort::AbortSignal;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON-object arguments.
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A single content item inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent::Text { text: text.into() }
    }
}

/// Whether a tool's output can be trusted to shape subsequent model behavior
/// without additional scrutiny (e.g. a read-only lookup) or whether it
/// originated from untrusted external content (e.g. a fetched web page) and
/// should be handled defensively by callers that render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    Trusted,
    Untrusted,
}

/// The result of executing a tool, or a partial snapshot of one emitted via
/// `on_update` while the tool is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub trust: Trust,
}

impl ToolResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(content)],
            details: None,
            trust: Trust::Trusted,
        }
    }

    pub fn untrusted_text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(content)],
            details: None,
            trust: Trust::Untrusted,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Plain-text concatenation of every `Text` part — the representation
    /// the loop falls back to when building a tool-result message.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Callback a tool body invokes with a partial `ToolResult` while it is still
/// running. The loop forwards every call as a `tool_execution_update` event.
pub type OnUpdate = Arc<dyn Fn(ToolResult) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Build an `OnUpdate` from a plain async closure.
pub fn on_update<F, Fut>(f: F) -> OnUpdate
where
    F: Fn(ToolResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |r| Box::pin(f(r)))
}

/// A no-op `OnUpdate`, useful for tests and for callers that don't want
/// streaming progress.
pub fn no_update() -> OnUpdate {
    Arc::new(|_| Box::pin(async {}))
}

/// Trait every callable tool implements. Tool *implementations* are out of
/// this crate's scope — this trait is the contract the loop dispatches
/// against.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema-shaped parameter description, surfaced to the model.
    fn parameters(&self) -> Value;
    /// Human-readable label (e.g. for a UI button), defaults to `name()`.
    fn label(&self) -> &str {
        self.name()
    }
    /// Execute one call. `on_update` may be invoked any number of times
    /// before returning; `abort` should be polled for long-running tools.
    async fn execute(
        &self,
        call_id: &str,
        arguments: &Map<String, Value>,
        abort: AbortSignal,
        on_update: OnUpdate,
    ) -> anyhow::Result<ToolResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input back"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _call_id: &str,
            arguments: &Map<String, Value>,
            _abort: AbortSignal,
            _on_update: OnUpdate,
        ) -> anyhow::Result<ToolResult> {
            let text = arguments.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(ToolResult::text(text))
        }
    }

    #[tokio::test]
    async fn echo_tool_roundtrips_text() {
        let tool = EchoTool;
        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        let result = tool
            .execute("c1", &args, AbortSignal::new(), no_update())
            .await
            .unwrap();
        assert_eq!(result.as_text(), "hi");
        assert_eq!(result.trust, Trust::Trusted);
    }

    #[test]
    fn label_defaults_to_name() {
        let tool = EchoTool;
        assert_eq!(tool.label(), tool.name());
    }

    #[test]
    fn tool_result_as_text_ignores_images() {
        let result = ToolResult {
            content: vec![
                ToolContent::text("a"),
                ToolContent::Image {
                    data: "abc".into(),
                    mime_type: "image/png".into(),
                },
                ToolContent::text("b"),
            ],
            details: None,
            trust: Trust::Trusted,
        };
        assert_eq!(result.as_text(), "a\nb");
    }
}
