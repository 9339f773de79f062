// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON input
    pub input: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// A tool schema as offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Coarse runtime class of a tool.  Drives timeout floors and heartbeat
/// decisions in the executor; it is about *how the tool runs*, not what it
/// returns (see [`OutputCategory`] for that).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    #[default]
    Generic,
    /// Web or knowledge search.
    Search,
    /// Drives a real browser; slow to start, slow to settle.
    Browser,
    /// Runs a host process; may carry its own timeout in the input.
    Command,
    /// Spawns a sub-agent; the deadline scales with the requested run time.
    ChildAgent,
    /// Image understanding / OCR.
    Vision,
    /// Pushes visual content to the user-facing canvas.
    Canvas,
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, the executor uses
/// this category to pick the right extraction strategy.  Each tool declares
/// its own category; the executor never hard-codes tool names here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator so the
    /// model sees both the top of the file and the end.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every tool visible to the executor must implement.
///
/// The real tool fleet lives in the host; the executor only needs this
/// capability surface plus the classification hooks below.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn input_schema(&self) -> Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Generic
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    /// Idempotent tools are exempt from duplicate-call rejection.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Mutating tools are denied outside execute mode, and a successful
    /// mutation invalidates the executor's file-operation caches.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Technical tools (shell, code execution, debuggers) are denied in
    /// task domains that forbid them.
    fn is_technical(&self) -> bool {
        false
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_output_is_not_error() {
        let o = ToolOutput::ok("c1", "done");
        assert!(!o.is_error);
        assert_eq!(o.content, "done");
        assert_eq!(o.call_id, "c1");
    }

    #[test]
    fn err_output_is_error() {
        let o = ToolOutput::err("c2", "boom");
        assert!(o.is_error);
        assert_eq!(o.content, "boom");
    }

    #[test]
    fn default_kind_and_category_are_generic() {
        struct Nop;
        #[async_trait]
        impl Tool for Nop {
            fn name(&self) -> &str { "nop" }
            fn description(&self) -> &str { "does nothing" }
            fn input_schema(&self) -> Value { serde_json::json!({"type": "object"}) }
            async fn execute(&self, call: &ToolCall) -> ToolOutput {
                ToolOutput::ok(&call.id, "")
            }
        }
        let t = Nop;
        assert_eq!(t.kind(), ToolKind::Generic);
        assert_eq!(t.output_category(), OutputCategory::Generic);
        assert!(!t.is_idempotent());
        assert!(!t.is_mutating());
        assert!(!t.is_technical());
    }
}
