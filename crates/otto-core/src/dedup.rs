// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::{Duration, Instant};

use serde_json::Value;

/// How long a past call stays relevant for duplicate detection.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);
/// Prior identical-input calls tolerated within the window: an exact repeat
/// of a call that already ran is rejected outright.
const MAX_IDENTICAL: usize = 1;
/// Same-tool same-target calls tolerated within the window.
const MAX_SIMILAR: usize = 2;

/// One observed tool call, normalized for comparison.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    /// Canonical JSON of the input (serde_json sorts object keys).
    pub signature: String,
    /// Coarse-grained target: file path, URL, query, or command.
    pub target: Option<String>,
    pub at: Instant,
}

/// Verdict from the deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Allow,
    /// Exact input repeated too many times inside the window.
    DuplicateExact,
    /// Same tool hammering the same target with trivially varied inputs.
    DuplicateSimilar,
}

/// Sliding-window duplicate detector for tool calls.
///
/// Exact repeats waste a round-trip and usually mean the model ignored the
/// previous result; near-repeats (same tool, same target) are the classic
/// thrash pattern.  Idempotent-tagged tools are exempted by the caller
/// before this runs.
#[derive(Debug, Default)]
pub struct ToolCallDeduplicator {
    window: Option<Duration>,
    history: Vec<ToolCallRecord>,
}

impl ToolCallDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the window (tests use a tiny one to exercise expiry).
    pub fn with_window(window: Duration) -> Self {
        Self { window: Some(window), history: Vec::new() }
    }

    fn window(&self) -> Duration {
        self.window.unwrap_or(DEDUP_WINDOW)
    }

    /// Judge a proposed call against the recent history.  Does not record;
    /// call [`ToolCallDeduplicator::record`] once the call is admitted.
    pub fn check(&mut self, tool: &str, input: &Value) -> DedupVerdict {
        self.expire();
        let signature = signature_for(tool, input);
        let identical = self.history.iter().filter(|r| r.signature == signature).count();
        if identical >= MAX_IDENTICAL {
            return DedupVerdict::DuplicateExact;
        }
        if let Some(target) = extract_target(input) {
            let similar = self
                .history
                .iter()
                .filter(|r| r.tool == tool && r.target.as_deref() == Some(target.as_str()))
                .count();
            if similar >= MAX_SIMILAR && identical == 0 {
                return DedupVerdict::DuplicateSimilar;
            }
        }
        DedupVerdict::Allow
    }

    /// Record an admitted call.
    pub fn record(&mut self, tool: &str, input: &Value) {
        self.history.push(ToolCallRecord {
            tool: tool.to_string(),
            signature: signature_for(tool, input),
            target: extract_target(input),
            at: Instant::now(),
        });
    }

    /// Drop records older than the window.
    fn expire(&mut self) {
        let window = self.window();
        let now = Instant::now();
        self.history.retain(|r| now.duration_since(r.at) <= window);
    }

    /// Forget everything (full task retry).
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn recorded(&self) -> usize {
        self.history.len()
    }
}

fn signature_for(tool: &str, input: &Value) -> String {
    format!("{tool}:{input}")
}

/// Pull the coarse target out of a tool input: the field the call is
/// "about".  Checked in priority order so `path` wins over `query` when a
/// tool carries both.
pub fn extract_target(input: &Value) -> Option<String> {
    const TARGET_FIELDS: [&str; 8] =
        ["path", "file_path", "filename", "directory", "url", "query", "pattern", "command"];
    let obj = input.as_object()?;
    for field in TARGET_FIELDS {
        if let Some(v) = obj.get(field).and_then(|v| v.as_str()) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_call_passes_exact_repeat_is_blocked() {
        let mut d = ToolCallDeduplicator::new();
        let input = json!({"query": "rust async"});
        assert_eq!(d.check("web_search", &input), DedupVerdict::Allow);
        d.record("web_search", &input);
        assert_eq!(d.check("web_search", &input), DedupVerdict::DuplicateExact);
    }

    #[test]
    fn different_inputs_are_allowed() {
        let mut d = ToolCallDeduplicator::new();
        d.record("web_search", &json!({"query": "a"}));
        d.record("web_search", &json!({"query": "b"}));
        assert_eq!(d.check("web_search", &json!({"query": "c"})), DedupVerdict::Allow);
    }

    #[test]
    fn same_target_with_varied_extras_is_similar_duplicate() {
        let mut d = ToolCallDeduplicator::new();
        d.record("read_file", &json!({"path": "/w/readme", "offset": 0}));
        d.record("read_file", &json!({"path": "/w/readme", "offset": 100}));
        let verdict = d.check("read_file", &json!({"path": "/w/readme", "offset": 200}));
        assert_eq!(verdict, DedupVerdict::DuplicateSimilar);
    }

    #[test]
    fn same_target_different_tool_is_allowed() {
        let mut d = ToolCallDeduplicator::new();
        d.record("read_file", &json!({"path": "/w/x"}));
        d.record("read_file", &json!({"path": "/w/x"}));
        assert_eq!(d.check("edit_file", &json!({"path": "/w/x"})), DedupVerdict::Allow);
    }

    #[test]
    fn records_expire_outside_window() {
        let mut d = ToolCallDeduplicator::with_window(Duration::from_millis(5));
        let input = json!({"query": "x"});
        d.record("web_search", &input);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(d.check("web_search", &input), DedupVerdict::Allow);
        assert_eq!(d.recorded(), 0, "expired records are dropped");
    }

    #[test]
    fn reset_clears_history() {
        let mut d = ToolCallDeduplicator::new();
        let input = json!({"query": "x"});
        d.record("web_search", &input);
        d.reset();
        assert_eq!(d.check("web_search", &input), DedupVerdict::Allow);
    }

    #[test]
    fn target_extraction_priority() {
        assert_eq!(
            extract_target(&json!({"query": "q", "path": "/p"})).as_deref(),
            Some("/p"),
            "path outranks query"
        );
        assert_eq!(extract_target(&json!({"url": "https://e.com"})).as_deref(), Some("https://e.com"));
        assert_eq!(extract_target(&json!({"other": 1})), None);
        assert_eq!(extract_target(&json!("not an object")), None);
    }
}
