// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a task was cancelled.  Only `Timeout` triggers best-effort
/// finalization before unwinding; the others are fatal and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Timeout,
    Shutdown,
}

/// Which budget was exhausted.  Surfaced with a structured code so the host
/// can offer a "Continue" action for turn limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    TurnLimit,
    IterationLimit,
    ToolCallLimit,
    WebSearchLimit,
    TokenLimit,
    CostLimit,
}

impl BudgetLimit {
    /// Structured error code forwarded in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            BudgetLimit::TurnLimit => "TURN_LIMIT_EXCEEDED",
            BudgetLimit::IterationLimit => "ITERATION_LIMIT_EXCEEDED",
            BudgetLimit::ToolCallLimit => "TOOL_CALL_LIMIT_EXCEEDED",
            BudgetLimit::WebSearchLimit => "WEB_SEARCH_LIMIT_EXCEEDED",
            BudgetLimit::TokenLimit => "TOKEN_LIMIT_EXCEEDED",
            BudgetLimit::CostLimit => "COST_LIMIT_EXCEEDED",
        }
    }

    /// Limits the host can lift by granting more budget.
    pub fn continuable(&self) -> bool {
        matches!(self, BudgetLimit::TurnLimit | BudgetLimit::IterationLimit)
    }
}

/// Coarse classification of a failed task, recorded on the task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    BudgetExhausted,
    ToolError,
    ContractError,
    Unknown,
}

/// Lifecycle-affecting errors thrown out of the turn loop.
///
/// Tool-level failures never appear here — they become
/// `tool_result { is_error: true }` blocks in the history.  Only conditions
/// that change what happens to the *task* are worth an error type.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task cancelled ({reason:?})")]
    Cancelled { reason: CancelReason },

    /// Non-error sentinel: the model asked a blocking question and the task
    /// paused to wait for the user.  Callers treat this as a normal pause.
    #[error("task paused awaiting user input")]
    AwaitingUserInput { reason_code: &'static str },

    #[error("budget exhausted: {limit:?}")]
    BudgetExhausted { limit: BudgetLimit },

    #[error("completion guard violation: {detail}")]
    CompletionGuard { detail: String },

    #[error("step {step_id} timed out after {elapsed_ms} ms")]
    StepTimeout { step_id: String, elapsed_ms: u64 },

    #[error("provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

impl ExecutorError {
    /// Whether this error is an abort-like condition (cancellation or
    /// deadline) rather than a semantic failure.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            ExecutorError::Cancelled { .. } | ExecutorError::StepTimeout { .. }
        )
    }

    /// The failure class recorded on the task when this error ends it.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ExecutorError::BudgetExhausted { .. } => FailureClass::BudgetExhausted,
            ExecutorError::CompletionGuard { .. } => FailureClass::ContractError,
            _ => FailureClass::Unknown,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
