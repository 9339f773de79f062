// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use otto_config::{AgentConfig, BudgetContract, EnvFlags};
use otto_model::Usage;
use serde::{Deserialize, Serialize};

use crate::error::{BudgetLimit, ExecutorError};

/// Turns left at which the soft-landing nudge is armed.
pub const TURN_SOFT_LANDING_RESERVE: u32 = 2;

/// EWMA weight for new output-TPS observations.
const TPS_EWMA_ALPHA: f64 = 0.2;
/// Output-token floor for tool-bearing calls; below this the model cannot
/// reliably emit a tool call plus its arguments.
const TOOL_CALL_TOKEN_FLOOR: u32 = 8_192;
/// Ceiling on any single call deadline.
const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(600);
/// Base deadline before TPS evidence exists.
const BASE_CALL_TIMEOUT: Duration = Duration::from_secs(240);

/// Counters for one continuation segment of a task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub iterations: u32,
    pub global_turns: u32,
    pub tool_calls: u32,
    pub web_search_calls: u32,
    pub duplicates_blocked: u32,
    pub consecutive_search_steps: u32,
    pub auto_recovery_steps: u32,
}

impl BudgetUsage {
    fn add(&self, other: &BudgetUsage) -> BudgetUsage {
        BudgetUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cost_usd: self.cost_usd + other.cost_usd,
            iterations: self.iterations + other.iterations,
            global_turns: self.global_turns + other.global_turns,
            tool_calls: self.tool_calls + other.tool_calls,
            web_search_calls: self.web_search_calls + other.web_search_calls,
            duplicates_blocked: self.duplicates_blocked + other.duplicates_blocked,
            // Consecutive counters do not survive a continuation boundary.
            consecutive_search_steps: other.consecutive_search_steps,
            auto_recovery_steps: self.auto_recovery_steps + other.auto_recovery_steps,
        }
    }
}

/// Per-attempt limits for one LLM call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallAttemptLimits {
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// The budget governor: every turn and every tool call passes through here
/// before it is allowed to spend anything.
///
/// Counters are split into the current segment (`usage`) and offsets carried
/// over from previous segments, so that "continue after budget exhausted"
/// can zero the enforced counters while cumulative totals stay truthful.
#[derive(Debug)]
pub struct BudgetGovernor {
    contract: BudgetContract,
    contracts_enabled: bool,
    task_max_turns: u32,
    max_tokens: Option<u64>,
    max_cost_usd: Option<f64>,
    flags: EnvFlags,
    usage: BudgetUsage,
    offsets: BudgetUsage,
    soft_landing_injected: bool,
    /// EWMA of observed output tokens per second; None until first sample.
    tps_ewma: Option<f64>,
}

impl BudgetGovernor {
    pub fn new(config: &AgentConfig, flags: EnvFlags) -> Self {
        Self {
            contract: config.budget_contract(),
            contracts_enabled: flags.budget_contracts_enabled,
            task_max_turns: config.max_turns,
            max_tokens: config.max_tokens,
            max_cost_usd: config.max_cost_usd,
            flags,
            usage: BudgetUsage::default(),
            offsets: BudgetUsage::default(),
            soft_landing_injected: false,
            tps_ewma: None,
        }
    }

    /// Effective turn ceiling: the task's own cap, tightened by the contract
    /// when contracts are enabled.
    pub fn max_global_turns(&self) -> u32 {
        if self.contracts_enabled {
            self.task_max_turns.min(self.contract.max_turns)
        } else {
            self.task_max_turns
        }
    }

    pub fn usage(&self) -> &BudgetUsage {
        &self.usage
    }

    /// Cumulative totals across all continuation segments.
    pub fn cumulative(&self) -> BudgetUsage {
        self.offsets.add(&self.usage)
    }

    pub fn remaining_turns(&self) -> u32 {
        self.max_global_turns().saturating_sub(self.usage.global_turns)
    }

    // ── Gates ─────────────────────────────────────────────────────────────────

    /// Gate run before every LLM call.
    pub fn check_before_llm_call(&self) -> Result<(), ExecutorError> {
        if self.usage.global_turns >= self.max_global_turns() {
            return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::TurnLimit });
        }
        // Iterations include non-admitted work (recoveries, nudge turns);
        // give them slack over the turn cap but keep a hard stop.
        if self.usage.iterations >= self.max_global_turns().saturating_mul(2).max(8) {
            return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::IterationLimit });
        }
        let cumulative = self.cumulative();
        if let Some(cap) = self.max_tokens {
            if cumulative.output_tokens >= cap {
                return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::TokenLimit });
            }
        }
        if let Some(cap) = self.max_cost_usd {
            if cumulative.cost_usd >= cap {
                return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::CostLimit });
            }
        }
        Ok(())
    }

    /// Gate run before every tool call.
    pub fn check_before_tool_call(&self, is_web_search: bool) -> Result<(), ExecutorError> {
        if !self.contracts_enabled {
            return Ok(());
        }
        if self.usage.tool_calls >= self.contract.max_tool_calls {
            return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::ToolCallLimit });
        }
        if is_web_search && self.usage.web_search_calls >= self.contract.max_web_search_calls {
            return Err(ExecutorError::BudgetExhausted { limit: BudgetLimit::WebSearchLimit });
        }
        Ok(())
    }

    // ── Recording ─────────────────────────────────────────────────────────────

    /// Record one admitted LLM response.
    pub fn record_turn(&mut self, usage: &Usage) {
        self.usage.global_turns += 1;
        self.usage.input_tokens += usage.input_tokens;
        self.usage.output_tokens += usage.output_tokens;
        self.usage.cost_usd += usage.cost_usd;
    }

    /// Record one loop iteration (admitted or not).
    pub fn record_iteration(&mut self) {
        self.usage.iterations += 1;
    }

    pub fn record_tool_call(&mut self, is_web_search: bool) {
        self.usage.tool_calls += 1;
        if is_web_search {
            self.usage.web_search_calls += 1;
        }
    }

    pub fn record_duplicate_blocked(&mut self) {
        self.usage.duplicates_blocked += 1;
    }

    /// Note whether the step that just ended was dominated by searching.
    pub fn note_step_search_dominated(&mut self, was_search: bool) {
        if was_search {
            self.usage.consecutive_search_steps += 1;
        } else {
            self.usage.consecutive_search_steps = 0;
        }
    }

    pub fn search_streak_exhausted(&self) -> bool {
        self.contracts_enabled
            && self.usage.consecutive_search_steps >= self.contract.max_consecutive_search_steps
    }

    /// Consume one auto-recovery slot; false when the budget is spent.
    pub fn try_consume_recovery_slot(&mut self) -> bool {
        if self.contracts_enabled
            && self.usage.auto_recovery_steps >= self.contract.max_auto_recovery_steps
        {
            return false;
        }
        self.usage.auto_recovery_steps += 1;
        true
    }

    /// Feed an output-rate observation from a finished call.
    pub fn observe_tps(&mut self, output_tokens: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if output_tokens == 0 || secs <= 0.0 {
            return;
        }
        let sample = output_tokens as f64 / secs;
        self.tps_ewma = Some(match self.tps_ewma {
            Some(prev) => prev * (1.0 - TPS_EWMA_ALPHA) + sample * TPS_EWMA_ALPHA,
            None => sample,
        });
    }

    pub fn observed_tps(&self) -> f64 {
        self.tps_ewma.unwrap_or(self.flags.output_tps_fallback)
    }

    // ── Soft landing ──────────────────────────────────────────────────────────

    /// Arm the soft-landing nudge.  Fires at most once per step (the turn
    /// loop resets the flag at step boundaries).
    pub fn should_inject_soft_landing(&mut self) -> bool {
        if self.soft_landing_injected {
            return false;
        }
        if self.remaining_turns() <= TURN_SOFT_LANDING_RESERVE {
            self.soft_landing_injected = true;
            return true;
        }
        false
    }

    /// Reset the per-step one-shot state.
    pub fn reset_step_oneshots(&mut self) {
        self.soft_landing_injected = false;
    }

    // ── Per-attempt limits ────────────────────────────────────────────────────

    /// Compute max_tokens and deadline for one call attempt.
    ///
    /// `attempt` counts retries of the same logical call (0 = first try).
    /// Retries decay both knobs so a pathological prompt converges instead
    /// of burning the full budget repeatedly; tool-bearing calls keep a
    /// token floor so the decay cannot make tool emission impossible.
    pub fn call_attempt_limits(
        &self,
        base_max_tokens: u32,
        attempt: u32,
        wants_tools: bool,
    ) -> CallAttemptLimits {
        let token_decay = self.flags.retry_token_decay.powi(attempt as i32);
        let mut max_tokens = ((base_max_tokens as f64) * token_decay) as u32;
        if wants_tools {
            max_tokens = max_tokens.max(TOOL_CALL_TOKEN_FLOOR.min(base_max_tokens));
        }
        max_tokens = max_tokens.max(256);

        let tps = self.observed_tps() * self.flags.tps_safety_factor;
        let min_needed = Duration::from_secs_f64((max_tokens as f64 / tps.max(1.0)) * 1.3);
        let timeout_decay = self.flags.retry_timeout_decay.powi(attempt as i32);
        let decayed = BASE_CALL_TIMEOUT.mul_f64(timeout_decay);
        let timeout = decayed.max(min_needed).min(MAX_CALL_TIMEOUT);

        CallAttemptLimits { max_tokens, timeout }
    }

    // ── Continuation ──────────────────────────────────────────────────────────

    /// Fold the current segment into the offsets and zero the enforced
    /// counters so the task can continue past a turn/iteration limit.
    /// Cumulative totals (tokens, cost) are preserved via the offsets.
    pub fn reset_for_continuation(&mut self) {
        self.offsets = self.offsets.add(&self.usage);
        self.usage = BudgetUsage::default();
        self.soft_landing_injected = false;
    }

    /// Restore cumulative totals from a snapshot.
    pub fn restore_offsets(&mut self, offsets: BudgetUsage) {
        self.offsets = offsets;
    }
}

/// Whether a candidate final answer covers enough ground to justify
/// partial-success finalization for a cron task that ran out of budget.
pub fn has_adequate_coverage(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return false;
    }
    let words = trimmed.split_whitespace().count();
    let sections = trimmed.lines().filter(|l| !l.trim().is_empty()).count();
    words >= 30 || (words >= 10 && sections >= 3)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
