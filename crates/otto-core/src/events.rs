// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use otto_model::Usage;

use crate::error::CancelReason;

/// Events emitted by the executor during a task run.
///
/// Consumers (daemon, UI) subscribe through an [`EventSink`].  Delivery is
/// strictly fire-and-forget: a slow or broken consumer must never stall or
/// fail the task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task entered the executing state
    Executing,
    PlanCreated {
        description: String,
        step_ids: Vec<String>,
    },
    PlanRevised {
        reason: String,
        step_count: usize,
    },
    PlanRevisionBlocked {
        reason: String,
    },
    StepStarted {
        step_id: String,
        description: String,
    },
    StepCompleted {
        step_id: String,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    StepSkipped {
        step_id: String,
    },
    StepFeedback {
        step_id: String,
        action: String,
    },
    StepRecoveryPlanned {
        step_id: String,
        recovery_step_ids: Vec<String>,
    },
    /// A tool call was admitted by the gatekeeper and is executing
    ToolCall {
        tool: String,
        call_id: String,
    },
    ToolResult {
        tool: String,
        call_id: String,
        is_error: bool,
    },
    ToolError {
        tool: String,
        call_id: String,
        message: String,
    },
    /// A tool call was rejected before execution (policy, dedup, budget)
    ToolBlocked {
        tool: String,
        call_id: String,
        reason: String,
    },
    ToolWarning {
        tool: String,
        message: String,
    },
    /// The gatekeeper rewrote tool parameters to a canonical shape
    ParameterInference {
        tool: String,
        from_field: String,
        to_field: String,
    },
    /// Heartbeat for long-running tools
    ProgressUpdate {
        tool: String,
        elapsed_ms: u64,
    },
    ProgressJournal {
        entry: String,
    },
    LlmRetry {
        attempt: u32,
        error: String,
    },
    LlmStreaming {
        chars: usize,
    },
    LlmUsage(Usage),
    MaxTokensRecovery {
        attempt: u32,
    },
    ContextSummarized {
        tokens_before: usize,
        tokens_after: usize,
        proactive: bool,
    },
    ConversationSnapshot {
        message_count: usize,
    },
    /// A tool was denied by the execution-mode / domain gate
    ModeGateBlocked {
        tool: String,
        mode: String,
    },
    ToolLoopDetected {
        category: String,
        signature: String,
    },
    LowProgressLoopDetected {
        target: String,
    },
    VariedFailureLoopDetected {
        tool: String,
        failures: u32,
    },
    StopReasonNudge {
        stop_reason: String,
        streak: u32,
    },
    ToolRecoveryPrompted {
        blockers: Vec<String>,
    },
    BudgetSoftLanding {
        remaining_turns: u32,
    },
    BudgetResetForContinuation,
    AwaitingUserInput {
        reason_code: String,
        question: String,
    },
    TaskPaused,
    TaskCompleted {
        terminal_status: String,
    },
    TaskCancelled {
        reason: CancelReason,
    },
    AssistantMessage {
        text: String,
    },
    WorkspaceSwitched {
        workspace: String,
    },
    WorkspacePermissionsUpdated {
        workspace: String,
    },
    CitationsCollected {
        count: usize,
    },
    ArtifactCreated {
        path: String,
    },
    Error {
        code: String,
        message: String,
        action_hint: Option<String>,
    },
}

impl TaskEvent {
    /// Stable wire name of this event type.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Executing => "executing",
            TaskEvent::PlanCreated { .. } => "plan_created",
            TaskEvent::PlanRevised { .. } => "plan_revised",
            TaskEvent::PlanRevisionBlocked { .. } => "plan_revision_blocked",
            TaskEvent::StepStarted { .. } => "step_started",
            TaskEvent::StepCompleted { .. } => "step_completed",
            TaskEvent::StepFailed { .. } => "step_failed",
            TaskEvent::StepSkipped { .. } => "step_skipped",
            TaskEvent::StepFeedback { .. } => "step_feedback",
            TaskEvent::StepRecoveryPlanned { .. } => "step_recovery_planned",
            TaskEvent::ToolCall { .. } => "tool_call",
            TaskEvent::ToolResult { .. } => "tool_result",
            TaskEvent::ToolError { .. } => "tool_error",
            TaskEvent::ToolBlocked { .. } => "tool_blocked",
            TaskEvent::ToolWarning { .. } => "tool_warning",
            TaskEvent::ParameterInference { .. } => "parameter_inference",
            TaskEvent::ProgressUpdate { .. } => "progress_update",
            TaskEvent::ProgressJournal { .. } => "progress_journal",
            TaskEvent::LlmRetry { .. } => "llm_retry",
            TaskEvent::LlmStreaming { .. } => "llm_streaming",
            TaskEvent::LlmUsage(_) => "llm_usage",
            TaskEvent::MaxTokensRecovery { .. } => "max_tokens_recovery",
            TaskEvent::ContextSummarized { .. } => "context_summarized",
            TaskEvent::ConversationSnapshot { .. } => "conversation_snapshot",
            TaskEvent::ModeGateBlocked { .. } => "mode_gate_blocked",
            TaskEvent::ToolLoopDetected { .. } => "tool_loop_detected",
            TaskEvent::LowProgressLoopDetected { .. } => "low_progress_loop_detected",
            TaskEvent::VariedFailureLoopDetected { .. } => "varied_failure_loop_detected",
            TaskEvent::StopReasonNudge { .. } => "stop_reason_nudge",
            TaskEvent::ToolRecoveryPrompted { .. } => "tool_recovery_prompted",
            TaskEvent::BudgetSoftLanding { .. } => "budget_soft_landing",
            TaskEvent::BudgetResetForContinuation => "budget_reset_for_continuation",
            TaskEvent::AwaitingUserInput { .. } => "awaiting_user_input",
            TaskEvent::TaskPaused => "task_paused",
            TaskEvent::TaskCompleted { .. } => "task_completed",
            TaskEvent::TaskCancelled { .. } => "task_cancelled",
            TaskEvent::AssistantMessage { .. } => "assistant_message",
            TaskEvent::WorkspaceSwitched { .. } => "workspace_switched",
            TaskEvent::WorkspacePermissionsUpdated { .. } => "workspace_permissions_updated",
            TaskEvent::CitationsCollected { .. } => "citations_collected",
            TaskEvent::ArtifactCreated { .. } => "artifact_created",
            TaskEvent::Error { .. } => "error",
        }
    }
}

/// Event delivery capability.  Implementations must be cheap and must not
/// block; the executor calls this inline from the turn loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

/// Sink that drops everything.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TaskEvent) {}
}

/// Sink that records every event; the workhorse of the scenario tests.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Kinds of all recorded events, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: TaskEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BudgetLimit;

    #[test]
    fn kind_names_match_wire_vocabulary() {
        assert_eq!(TaskEvent::Executing.kind(), "executing");
        assert_eq!(
            TaskEvent::ToolBlocked { tool: "t".into(), call_id: "c".into(), reason: "r".into() }.kind(),
            "tool_blocked"
        );
        assert_eq!(TaskEvent::BudgetResetForContinuation.kind(), "budget_reset_for_continuation");
    }

    #[test]
    fn collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        sink.emit(TaskEvent::Executing);
        sink.emit(TaskEvent::TaskPaused);
        assert_eq!(sink.kinds(), vec!["executing", "task_paused"]);
    }

    #[test]
    fn count_of_filters_by_kind() {
        let sink = CollectingSink::new();
        sink.emit(TaskEvent::Executing);
        sink.emit(TaskEvent::Executing);
        sink.emit(TaskEvent::TaskPaused);
        assert_eq!(sink.count_of("executing"), 2);
        assert_eq!(sink.count_of("task_paused"), 1);
        assert_eq!(sink.count_of("error"), 0);
    }

    #[test]
    fn null_sink_accepts_events() {
        NullSink.emit(TaskEvent::Executing);
    }

    #[test]
    fn error_event_carries_structured_code() {
        let e = TaskEvent::Error {
            code: BudgetLimit::TurnLimit.code().to_string(),
            message: "turn limit".into(),
            action_hint: Some("continue_task".into()),
        };
        assert_eq!(e.kind(), "error");
        match e {
            TaskEvent::Error { code, action_hint, .. } => {
                assert_eq!(code, "TURN_LIMIT_EXCEEDED");
                assert_eq!(action_hint.as_deref(), Some("continue_task"));
            }
            _ => unreachable!(),
        }
    }
}
