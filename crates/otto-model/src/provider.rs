// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::repair::parse_tool_input;
use crate::{CompletionRequest, CompletionResponse, ContentBlock, ResponseEvent, StopReason, Usage};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The LLM capability consumed by the executor.
///
/// Implementations live in the host (HTTP drivers, gateways); the executor
/// only ever sees this trait.  Transient wire errors (timeouts, 429/5xx)
/// are the provider boundary's problem — wrap any implementation in
/// [`crate::RetryingProvider`] to get exponential backoff.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider id for status display and events.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window in tokens for the active model.
    fn context_window(&self) -> usize {
        128_000
    }

    /// Maximum output tokens a single call may request.
    fn max_output_tokens(&self) -> usize {
        8_192
    }

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}

/// Drain a response stream into a [`CompletionResponse`], invoking
/// `on_progress` for each text delta.
///
/// Parallel tool calls may interleave argument fragments by index; they are
/// accumulated per index and flushed in index order after the stream ends.
/// Tool uses with an empty name cannot be dispatched and are dropped —
/// keeping them would corrupt the history sent back on the next turn.  An
/// empty id gets a synthetic fallback so the pairing invariant still holds.
pub async fn collect_response(
    mut stream: ResponseStream,
    mut on_progress: impl FnMut(&str) + Send,
) -> anyhow::Result<CompletionResponse> {
    let mut text = String::new();
    let mut pending: HashMap<u32, PendingToolUse> = HashMap::new();
    let mut usage = Usage::default();
    let mut stop_reason: Option<StopReason> = None;

    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                on_progress(&delta);
                text.push_str(&delta);
            }
            ResponseEvent::TextDelta(_) => {}
            ResponseEvent::ToolUse { index, id, name, arguments } => {
                let p = pending.entry(index).or_default();
                if !id.is_empty() {
                    p.id = id;
                }
                if !name.is_empty() {
                    p.name = name;
                }
                p.args_buf.push_str(&arguments);
            }
            ResponseEvent::Usage(u) => usage.add(&u),
            ResponseEvent::Stop(reason) => stop_reason = Some(reason),
            ResponseEvent::Done => break,
            ResponseEvent::Error(e) => {
                warn!("model stream error: {e}");
            }
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }

    let mut ordered: Vec<(u32, PendingToolUse)> = pending.into_iter().collect();
    ordered.sort_by_key(|(idx, _)| *idx);
    for (i, (_, p)) in ordered.into_iter().enumerate() {
        if p.name.is_empty() {
            warn!(tool_use_id = %p.id, "dropping tool use with empty name from model; cannot dispatch");
            continue;
        }
        let id = if p.id.is_empty() {
            warn!(tool_name = %p.name, "tool use from model had empty id; generated synthetic id");
            format!("tu_synthetic_{i}")
        } else {
            p.id
        };
        let input = parse_tool_input(&p.name, &id, &p.args_buf);
        content.push(ContentBlock::ToolUse { id, name: p.name, input });
    }

    let has_tool_use = content.iter().any(|b| b.is_tool_use());
    let stop_reason = stop_reason.unwrap_or(if has_tool_use {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    });

    Ok(CompletionResponse { content, stop_reason, usage })
}

#[derive(Default)]
struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn stream_of(events: Vec<ResponseEvent>) -> ResponseStream {
        Box::pin(stream::iter(events.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn collect_accumulates_text_deltas() {
        let s = stream_of(vec![
            ResponseEvent::TextDelta("hel".into()),
            ResponseEvent::TextDelta("lo".into()),
            ResponseEvent::Stop(StopReason::EndTurn),
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        assert_eq!(r.text(), "hello");
        assert_eq!(r.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn collect_reassembles_interleaved_tool_args() {
        let s = stream_of(vec![
            ResponseEvent::ToolUse { index: 0, id: "a".into(), name: "grep".into(), arguments: "{\"pat".into() },
            ResponseEvent::ToolUse { index: 1, id: "b".into(), name: "read_file".into(), arguments: "{}".into() },
            ResponseEvent::ToolUse { index: 0, id: "".into(), name: "".into(), arguments: "tern\":\"x\"}".into() },
            ResponseEvent::Stop(StopReason::ToolUse),
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        let uses = r.tool_uses();
        assert_eq!(uses.len(), 2);
        match uses[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "a");
                assert_eq!(name, "grep");
                assert_eq!(input["pattern"], "x");
            }
            _ => panic!("expected tool use"),
        }
    }

    #[tokio::test]
    async fn collect_drops_nameless_tool_use() {
        let s = stream_of(vec![
            ResponseEvent::ToolUse { index: 0, id: "x".into(), name: "".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        assert!(r.tool_uses().is_empty());
    }

    #[tokio::test]
    async fn collect_synthesizes_missing_tool_use_id() {
        let s = stream_of(vec![
            ResponseEvent::ToolUse { index: 0, id: "".into(), name: "shell".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        match &r.content[0] {
            ContentBlock::ToolUse { id, .. } => assert!(id.starts_with("tu_synthetic_")),
            _ => panic!("expected tool use"),
        }
    }

    #[tokio::test]
    async fn collect_infers_stop_reason_from_content() {
        let s = stream_of(vec![
            ResponseEvent::ToolUse { index: 0, id: "a".into(), name: "t".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        assert_eq!(r.stop_reason, StopReason::ToolUse);

        let s = stream_of(vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done]);
        let r = collect_response(s, |_| {}).await.unwrap();
        assert_eq!(r.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn collect_invokes_progress_callback() {
        let mut seen = Vec::new();
        let s = stream_of(vec![
            ResponseEvent::TextDelta("a".into()),
            ResponseEvent::TextDelta("b".into()),
            ResponseEvent::Done,
        ]);
        collect_response(s, |d| seen.push(d.to_string())).await.unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn collect_sums_usage_events() {
        let s = stream_of(vec![
            ResponseEvent::Usage(Usage { input_tokens: 100, output_tokens: 5, ..Usage::default() }),
            ResponseEvent::Usage(Usage { output_tokens: 7, ..Usage::default() }),
            ResponseEvent::Done,
        ]);
        let r = collect_response(s, |_| {}).await.unwrap();
        assert_eq!(r.usage.input_tokens, 100);
        assert_eq!(r.usage.output_tokens, 12);
    }
}
