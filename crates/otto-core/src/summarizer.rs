// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use otto_model::{collect_response, CompletionRequest, ContentBlock, LlmProvider, Message, MessageContent, Role};
use otto_tools::OutputCategory;
use tracing::warn;

use crate::compact::smart_truncate;

// Per-item clamps when formatting the dropped transcript.  User words are
// the task definition and must survive harder than assistant narration;
// tool traffic compresses hardest.
const USER_CLAMP_TOKENS: usize = 600;
const ASSISTANT_CLAMP_TOKENS: usize = 300;
const TOOL_USE_CLAMP_TOKENS: usize = 80;
const TOOL_RESULT_CLAMP_TOKENS: usize = 150;

const SUMMARY_PROMPT: &str = "\
You are taking over a task from a previous agent whose conversation history \
is being trimmed for space. Produce a handoff summary of the transcript \
below using EXACTLY the following Markdown sections — do not add or remove \
sections. Be information-dense: preserve file paths, identifiers, error \
messages, and decisions verbatim where they matter.

## Primary Request
## User Messages
## Work Completed
## Errors and Fixes
## Key Technical Details
## Decisions
## Pending Work
## Current State
## Recommended Next Step";

/// Generates the handoff summary inserted when compaction drops messages.
///
/// The summary is framed as a handoff from a previous agent so the model
/// treats it as authoritative context rather than something it may second-
/// guess.  On any model failure the deterministic truncated transcript is
/// used instead — compaction must never be blocked by a flaky summarizer.
pub struct CompactionSummarizer {
    provider: Arc<dyn LlmProvider>,
}

impl CompactionSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Summarize the removed slice into at most `budget_tokens` tokens.
    pub async fn summarize(&self, removed: &[Message], budget_tokens: usize) -> String {
        let transcript = format_transcript(removed);
        let request = CompletionRequest {
            system: None,
            messages: vec![Message::user(format!("{SUMMARY_PROMPT}\n\n---\n\n{transcript}"))],
            tools: Vec::new(),
            max_tokens: Some((budget_tokens as u32).max(256)),
            stream: false,
        };

        let summary = match self.provider.complete(request).await {
            Ok(stream) => match collect_response(stream, |_| {}).await {
                Ok(response) => {
                    let text = response.text();
                    if text.trim().is_empty() {
                        warn!("compaction summary came back empty; using transcript fallback");
                        transcript.clone()
                    } else {
                        text
                    }
                }
                Err(e) => {
                    warn!("compaction summary stream failed, using transcript fallback: {e}");
                    transcript.clone()
                }
            },
            Err(e) => {
                warn!("compaction summary call failed, using transcript fallback: {e}");
                transcript.clone()
            }
        };

        // Post-insertion size enforcement: the summary must not push the
        // window back over the limit it just relieved.
        let framed = format!(
            "[Handoff from a previous agent — earlier conversation was compacted. \
             Treat this summary as authoritative context.]\n\n{summary}"
        );
        smart_truncate(&framed, OutputCategory::Generic, budget_tokens.max(64))
    }
}

/// Role-aware transcript of the dropped messages, clamped per item.
fn format_transcript(removed: &[Message]) -> String {
    let mut out = Vec::with_capacity(removed.len());
    for msg in removed {
        match (&msg.role, &msg.content) {
            (Role::User, MessageContent::Text(t)) => {
                out.push(format!("User: {}", clamp(t, USER_CLAMP_TOKENS)));
            }
            (Role::Assistant, MessageContent::Text(t)) => {
                out.push(format!("Assistant: {}", clamp(t, ASSISTANT_CLAMP_TOKENS)));
            }
            (role, MessageContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            let (label, budget) = match role {
                                Role::User => ("User", USER_CLAMP_TOKENS),
                                Role::Assistant => ("Assistant", ASSISTANT_CLAMP_TOKENS),
                            };
                            out.push(format!("{label}: {}", clamp(text, budget)));
                        }
                        ContentBlock::Image { media_type, .. } => {
                            out.push(format!("[image: {media_type}]"));
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            out.push(format!(
                                "[tool_use: {name}({})]",
                                clamp(&input.to_string(), TOOL_USE_CLAMP_TOKENS)
                            ));
                        }
                        ContentBlock::ToolResult { content, is_error, .. } => {
                            let marker = if *is_error { "tool_error" } else { "tool_result" };
                            out.push(format!(
                                "[{marker}: {}]",
                                clamp(content, TOOL_RESULT_CLAMP_TOKENS)
                            ));
                        }
                    }
                }
            }
        }
    }
    out.join("\n\n")
}

fn clamp(text: &str, budget_tokens: usize) -> String {
    smart_truncate(text, OutputCategory::Generic, budget_tokens)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otto_model::{ResponseStream, ScriptedMockProvider};
    use serde_json::json;

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }
        fn model_name(&self) -> &str {
            "failing-model"
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            anyhow::bail!("summarizer model is down")
        }
    }

    fn removed_messages() -> Vec<Message> {
        vec![
            Message::user("Please migrate the billing tables to the new schema"),
            Message::assistant_blocks(vec![
                ContentBlock::text("Starting with the schema inspection."),
                ContentBlock::tool_use("t1", "run_command", json!({"command": "psql -c '\\dt'"})),
            ]),
            Message::tool_results(vec![ContentBlock::tool_result("t1", "12 tables listed", false)]),
            Message::assistant("The inspection finished; proceeding with the migration plan."),
        ]
    }

    #[tokio::test]
    async fn summary_uses_model_output_and_handoff_frame() {
        let provider = Arc::new(ScriptedMockProvider::always_text(
            "## Primary Request\nMigrate billing tables\n## Current State\nInspection done",
        ));
        let s = CompactionSummarizer::new(provider);
        let out = s.summarize(&removed_messages(), 2_000).await;
        assert!(out.contains("Handoff from a previous agent"));
        assert!(out.contains("Migrate billing tables"));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_transcript() {
        let s = CompactionSummarizer::new(Arc::new(FailingProvider));
        let out = s.summarize(&removed_messages(), 2_000).await;
        assert!(out.contains("Handoff from a previous agent"));
        assert!(out.contains("billing tables"), "fallback must carry the transcript content");
        assert!(out.contains("[tool_result:"), "tool traffic appears in the fallback transcript");
    }

    #[tokio::test]
    async fn summary_is_clamped_to_budget() {
        let provider = Arc::new(ScriptedMockProvider::always_text("word ".repeat(5_000)));
        let s = CompactionSummarizer::new(provider);
        let out = s.summarize(&removed_messages(), 100).await;
        // 100 tokens ≈ 400 chars plus the truncation notice.
        assert!(out.len() < 1_000, "summary must respect its token budget: {}", out.len());
        assert!(out.contains("omitted"));
    }

    #[tokio::test]
    async fn summarizer_call_carries_no_tools() {
        let provider = Arc::new(ScriptedMockProvider::always_text("## Primary Request\nx"));
        let s = CompactionSummarizer::new(provider.clone());
        let _ = s.summarize(&removed_messages(), 500).await;
        let req = provider.last_request().unwrap();
        assert!(req.tools.is_empty(), "summary turns must be tool-free");
    }

    #[test]
    fn transcript_clamps_tool_traffic_hardest() {
        let removed = vec![
            Message::user("u ".repeat(2_000)),
            Message::tool_results(vec![ContentBlock::tool_result("t", "r ".repeat(2_000), false)]),
        ];
        let transcript = format_transcript(&removed);
        let user_line = transcript.lines().find(|l| l.starts_with("User:")).unwrap();
        let tool_line = transcript.lines().find(|l| l.starts_with("[tool_result")).unwrap();
        assert!(user_line.len() > tool_line.len(), "user content keeps more budget than tool output");
    }
}
