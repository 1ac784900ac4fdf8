// SPDX-License-Identifier: Apache-2.0
//! The callable-tool contract shared between the agent runtime and whatever
//! tools an embedder registers. Tool *implementations* live outside this
//! crate — only the trait, call/result shapes, and a convenience registry
//! live here.

pub mod abort;
pub mod registry;
pub mod tool;

pub use abort::{is_aborted, AbortSignal};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{no_update, on_update, OnUpdate, Tool, ToolCall, ToolContent, ToolResult, Trust};
