// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashSet, VecDeque};

use otto_config::TaskDomain;
use otto_model::StopReason;
use serde_json::Value;

use crate::dedup::extract_target;

/// Consecutive same-category same-signature calls that count as a loop.
const TOOL_LOOP_RUN: usize = 3;
/// Size of the sliding window for low-progress detection.
const LOW_PROGRESS_WINDOW: usize = 10;
/// Consecutive `tool_use` stops before the stop-reason nudge.
const TOOL_USE_STREAK_NUDGE: u32 = 8;
/// Consecutive `max_tokens` stops before the stop-reason nudge.
const MAX_TOKENS_STREAK_NUDGE: u32 = 2;

/// The one-shot nudges a step can receive.  Each fires at most once per
/// step (per follow-up for follow-up loops).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NudgeKind {
    LoopBreak,
    LowProgress,
    VariedFailure,
    StopReason,
    ToolRecovery,
    SoftLanding,
}

/// Detection verdicts raised after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// Three consecutive calls in the same category on the same signature.
    ToolLoop { category: String, signature: String },
    /// Too many calls against the same base target without progress.
    LowProgress { target: String },
    /// The model keeps stopping the same unproductive way.
    StopReasonStreak { stop_reason: StopReason, streak: u32 },
}

/// Stateful per-step loop detection.
///
/// Layered detectors over the stream of tool calls and stop reasons; all
/// nudge decisions go through [`LoopDetector::try_fire`] so the one-shot
/// guarantee is enforced in a single place.
#[derive(Debug)]
pub struct LoopDetector {
    /// (category, signature) of recent calls, newest last.
    recent: VecDeque<(String, Option<String>)>,
    /// (base target, progressed) of recent calls.
    target_hits: VecDeque<(String, bool)>,
    fired: HashSet<NudgeKind>,
    tool_use_streak: u32,
    max_tokens_streak: u32,
    /// Same-target hits (without progress) tolerated before a nudge.
    low_progress_k: u32,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::for_domain(TaskDomain::Auto)
    }

    /// Research tasks legitimately revisit the same sources more often than
    /// code tasks revisit the same file; widen the tolerance accordingly.
    pub fn for_domain(domain: TaskDomain) -> Self {
        let low_progress_k = match domain {
            TaskDomain::Research => 6,
            TaskDomain::Code | TaskDomain::Operations => 4,
            TaskDomain::General | TaskDomain::Auto => 5,
        };
        Self {
            recent: VecDeque::new(),
            target_hits: VecDeque::new(),
            fired: HashSet::new(),
            tool_use_streak: 0,
            max_tokens_streak: 0,
            low_progress_k,
        }
    }

    // ── One-shot bookkeeping ──────────────────────────────────────────────────

    /// Returns true exactly once per kind per step.
    pub fn try_fire(&mut self, kind: NudgeKind) -> bool {
        self.fired.insert(kind)
    }

    pub fn has_fired(&self, kind: NudgeKind) -> bool {
        self.fired.contains(&kind)
    }

    /// Reset at step / follow-up boundaries.
    pub fn reset_for_step(&mut self) {
        self.recent.clear();
        self.target_hits.clear();
        self.fired.clear();
        self.tool_use_streak = 0;
        self.max_tokens_streak = 0;
    }

    // ── Tool-call stream ──────────────────────────────────────────────────────

    /// Record an executed (or attempted) tool call and return any signal the
    /// call triggered.  `progressed` is false when the result added nothing
    /// new (error, duplicate, cached, empty).
    pub fn record_call(&mut self, tool: &str, input: &Value, progressed: bool) -> Option<LoopSignal> {
        let category = normalize_category(tool, input);
        let signature = call_signature(input);
        self.recent.push_back((category.clone(), signature.clone()));
        if self.recent.len() > LOW_PROGRESS_WINDOW {
            self.recent.pop_front();
        }

        if let Some(target) = extract_target(input) {
            self.target_hits.push_back((target, progressed));
            if self.target_hits.len() > LOW_PROGRESS_WINDOW {
                self.target_hits.pop_front();
            }
        }

        // Tool loop: the last TOOL_LOOP_RUN calls identical in category and
        // signature.
        if self.recent.len() >= TOOL_LOOP_RUN {
            let n = self.recent.len();
            let (cat0, sig0) = self.recent[n - 1].clone();
            let looped = sig0.is_some()
                && self
                    .recent
                    .iter()
                    .skip(n - TOOL_LOOP_RUN)
                    .all(|(c, s)| *c == cat0 && *s == sig0);
            if looped {
                return Some(LoopSignal::ToolLoop {
                    category: cat0,
                    signature: sig0.unwrap_or_default(),
                });
            }
        }

        // Low progress: K hits on the same base target without progress
        // inside the window.
        if let Some(target) = extract_target(input) {
            let base = base_target(&target);
            let stalled = self
                .target_hits
                .iter()
                .filter(|(t, progressed)| base_target(t) == base && !progressed)
                .count() as u32;
            if stalled >= self.low_progress_k {
                return Some(LoopSignal::LowProgress { target: base });
            }
        }
        None
    }

    // ── Stop-reason stream ────────────────────────────────────────────────────

    /// Record the stop reason of an admitted turn and return a streak signal
    /// when the model is stuck in a terminal pattern.
    pub fn note_stop_reason(&mut self, reason: StopReason) -> Option<LoopSignal> {
        match reason {
            StopReason::ToolUse => {
                self.tool_use_streak += 1;
                self.max_tokens_streak = 0;
                if self.tool_use_streak >= TOOL_USE_STREAK_NUDGE {
                    return Some(LoopSignal::StopReasonStreak {
                        stop_reason: StopReason::ToolUse,
                        streak: self.tool_use_streak,
                    });
                }
            }
            StopReason::MaxTokens => {
                self.max_tokens_streak += 1;
                self.tool_use_streak = 0;
                if self.max_tokens_streak >= MAX_TOKENS_STREAK_NUDGE {
                    return Some(LoopSignal::StopReasonStreak {
                        stop_reason: StopReason::MaxTokens,
                        streak: self.max_tokens_streak,
                    });
                }
            }
            StopReason::EndTurn | StopReason::Other => {
                self.tool_use_streak = 0;
                self.max_tokens_streak = 0;
            }
        }
        None
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse tool names into coarse categories so that switching between
/// grep, ripgrep, and `run_command` wrapping grep does not defeat the loop
/// detector.
pub fn normalize_category(tool: &str, input: &Value) -> String {
    let name = tool.to_lowercase();
    if name.contains("grep") || name.contains("search") || name.contains("find") {
        return "search".into();
    }
    if name == "run_command" || name == "shell" || name == "run_terminal_command" {
        if let Some(cmd) = input.get("command").and_then(|v| v.as_str()) {
            let cmd = cmd.trim_start();
            if cmd.starts_with("grep") || cmd.starts_with("rg") || cmd.starts_with("ag ") {
                return "search".into();
            }
            if cmd.starts_with("cat") || cmd.starts_with("head") || cmd.starts_with("tail") {
                return "read".into();
            }
            if cmd.starts_with("ls") {
                return "list".into();
            }
        }
        return "command".into();
    }
    if name.contains("read") {
        return "read".into();
    }
    if name.contains("list") {
        return "list".into();
    }
    if name.contains("fetch") || name.contains("browse") {
        return "fetch".into();
    }
    name
}

/// Signature of a call: its target plus any line/offset range.
fn call_signature(input: &Value) -> Option<String> {
    let target = extract_target(input)?;
    let mut sig = target;
    for field in ["line", "offset", "start_line", "limit"] {
        if let Some(n) = input.get(field).and_then(|v| v.as_u64()) {
            sig.push_str(&format!(":{field}={n}"));
        }
    }
    Some(sig)
}

/// Strip line/query noise down to the base target (path without range,
/// URL without fragment).
fn base_target(target: &str) -> String {
    target.split(&['#', '?'][..]).next().unwrap_or(target).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
