// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Net failures at which a tool is blocked for the rest of the task.
pub const CROSS_STEP_BLOCK_THRESHOLD: u32 = 6;
/// Hard failures at which the per-process circuit breaker opens.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
/// Failures (never offset by successes) at which the varied-failure nudge fires.
pub const VARIED_FAILURE_THRESHOLD: u32 = 5;

/// Cross-step failure accounting for tools.
///
/// Each failure increments, each success decrements (floor 0), so a tool
/// that intermittently works never gets blocked, while one that keeps
/// failing crosses the threshold and is cut off with text-fallback guidance.
/// Outlives steps; reset only on a full task retry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossStepFailures {
    net: HashMap<String, u32>,
}

impl CrossStepFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, tool: &str) {
        *self.net.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn record_success(&mut self, tool: &str) {
        if let Some(n) = self.net.get_mut(tool) {
            *n = n.saturating_sub(1);
        }
    }

    pub fn net_failures(&self, tool: &str) -> u32 {
        self.net.get(tool).copied().unwrap_or(0)
    }

    pub fn is_blocked(&self, tool: &str) -> bool {
        self.net_failures(tool) >= CROSS_STEP_BLOCK_THRESHOLD
    }

    /// Tools worth warning the model about when building step context.
    pub fn warnings(&self) -> Vec<(String, u32)> {
        let mut v: Vec<(String, u32)> = self
            .net
            .iter()
            .filter(|(_, &n)| n >= 2)
            .map(|(t, &n)| (t.clone(), n))
            .collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        v
    }

    pub fn reset(&mut self) {
        self.net.clear();
    }
}

/// Per-process circuit breaker.
///
/// A tool that reports hard failures (unavailable, timed out, tool-specific
/// fatal errors) gets disabled after a few strikes; subsequent calls are
/// answered with the stored last error instead of re-running a tool that is
/// known to be broken in this process.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    strikes: HashMap<String, u32>,
    last_error: HashMap<String, String>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hard_failure(&mut self, tool: &str, error: impl Into<String>) {
        *self.strikes.entry(tool.to_string()).or_insert(0) += 1;
        self.last_error.insert(tool.to_string(), error.into());
    }

    /// A success closes the breaker again.
    pub fn record_success(&mut self, tool: &str) {
        self.strikes.remove(tool);
        self.last_error.remove(tool);
    }

    pub fn is_open(&self, tool: &str) -> bool {
        self.strikes.get(tool).copied().unwrap_or(0) >= CIRCUIT_BREAKER_THRESHOLD
    }

    pub fn last_error(&self, tool: &str) -> Option<&str> {
        self.last_error.get(tool).map(|s| s.as_str())
    }
}

/// Whether a tool result looks like a hard failure rather than an
/// input-dependent error the model can correct.
pub fn is_hard_failure(content: &str) -> bool {
    let lower = content.to_lowercase();
    lower.contains("unavailable")
        || lower.contains("timed out")
        || lower.contains("not installed")
        || lower.contains("permission denied")
        || lower.contains("connection refused")
}

/// Per-tool failure counter that never resets on success.
///
/// Distinct from [`CrossStepFailures`]: this one measures total friction,
/// not net health.  A tool that fails five times over a run deserves a
/// nudge even if it succeeded in between.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariedFailures {
    total: HashMap<String, u32>,
}

impl VariedFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, tool: &str) {
        *self.total.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn failures(&self, tool: &str) -> u32 {
        self.total.get(tool).copied().unwrap_or(0)
    }

    /// The first tool that crossed the nudge threshold, if any.
    pub fn worst_offender(&self) -> Option<(String, u32)> {
        self.total
            .iter()
            .filter(|(_, &n)| n >= VARIED_FAILURE_THRESHOLD)
            .max_by_key(|(_, &n)| n)
            .map(|(t, &n)| (t.clone(), n))
    }

    pub fn reset(&mut self) {
        self.total.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
