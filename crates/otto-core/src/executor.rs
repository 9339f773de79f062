// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use otto_config::EnvFlags;
use otto_model::{collect_response, CompletionRequest, LlmProvider, Message, Usage};
use otto_tools::ToolRegistry;
use tracing::{info, warn};

use crate::budget::BudgetGovernor;
use crate::completion::{CompletionContract, CompletionEvidence, CompletionOracle};
use crate::conversation::ConversationLog;
use crate::detect::LoopDetector;
use crate::error::{CancelReason, ExecutorError, FailureClass};
use crate::events::{EventSink, NullSink, TaskEvent};
use crate::gatekeeper::ToolGatekeeper;
use crate::plan::{Plan, StepKind, StepStatus};
use crate::recovery::{classify_failure, recovery_signature, recovery_steps_for, RecoveryClass, RecoveryLedger};
use crate::services::{
    CitationTracker, KnowledgeGraphService, MemoryService, NullServices, PlaybookService,
};
use crate::signals::{ControlSignals, StepFeedback, StepFeedbackAction};
use crate::snapshot::{ConversationSnapshot, InMemorySnapshots, SnapshotStore};
use crate::task::{Task, TaskOutcome, TaskStatus, TerminalStatus};
use crate::turn::{FollowUpOutcome, StepOutcome, TurnLoop};

/// External capabilities the executor consumes.  Everything here is a
/// borrowed collaborator: the executor never reaches around these traits.
pub struct ExecutorDeps {
    pub provider: Arc<dyn LlmProvider>,
    pub registry: Arc<ToolRegistry>,
    pub events: Arc<dyn EventSink>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub memory: Arc<dyn MemoryService>,
    pub playbooks: Arc<dyn PlaybookService>,
    pub knowledge: Arc<dyn KnowledgeGraphService>,
    pub citations: Arc<dyn CitationTracker>,
    pub flags: EnvFlags,
    /// Host-provided pinned context blocks.
    pub user_profile: Option<String>,
    pub shared_context: Option<String>,
}

impl ExecutorDeps {
    /// Minimal wiring: the provider and registry are real, everything else
    /// is a no-op capability.
    pub fn new(provider: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>) -> Self {
        let null = Arc::new(NullServices);
        Self {
            provider,
            registry,
            events: Arc::new(NullSink),
            snapshots: Arc::new(InMemorySnapshots::new()),
            memory: null.clone(),
            playbooks: null.clone(),
            knowledge: null.clone(),
            citations: null,
            flags: EnvFlags::default(),
            user_profile: None,
            shared_context: None,
        }
    }
}

/// All mutable run state, guarded by the lifecycle mutex.
pub(crate) struct RunState {
    pub task: Task,
    pub plan: Option<Plan>,
    pub conversation: ConversationLog,
    pub budget: BudgetGovernor,
    pub gatekeeper: ToolGatekeeper,
    pub detector: LoopDetector,
    pub recovery: RecoveryLedger,
    pub evidence: CompletionEvidence,
    pub contract: CompletionContract,
    pub last_assistant_text: Option<String>,
    pub last_non_verification_output: Option<String>,
    pub tool_selection_epoch: u64,
    pub tool_usage_counts: HashMap<String, u32>,
    pub step_search_calls: u32,
    pub step_other_calls: u32,
    pub memory_recall_done: bool,
    pub last_memory_flush_tokens: usize,
    pub quality_passes_done: bool,
    /// Step ids whose failures were tolerated at finalization.
    pub warnings: Vec<String>,
}

impl RunState {
    fn new(task: Task, flags: &EnvFlags) -> Self {
        let budget = BudgetGovernor::new(&task.agent_config, flags.clone());
        let detector = LoopDetector::for_domain(task.agent_config.task_domain);
        let contract = CompletionContract::derive(&task);
        Self {
            task,
            plan: None,
            conversation: ConversationLog::new(),
            budget,
            gatekeeper: ToolGatekeeper::new(),
            detector,
            recovery: RecoveryLedger::new(),
            evidence: CompletionEvidence::default(),
            contract,
            last_assistant_text: None,
            last_non_verification_output: None,
            tool_selection_epoch: 0,
            tool_usage_counts: HashMap::new(),
            step_search_calls: 0,
            step_other_calls: 0,
            memory_recall_done: false,
            last_memory_flush_tokens: 0,
            quality_passes_done: false,
            warnings: Vec::new(),
        }
    }

    pub fn current_step_description(&self) -> Option<String> {
        self.plan.as_ref()?.current_step().map(|s| s.description.clone())
    }

    fn cumulative_usage(&self) -> Usage {
        let b = self.budget.cumulative();
        Usage {
            input_tokens: b.input_tokens,
            output_tokens: b.output_tokens,
            cost_usd: b.cost_usd,
            ..Usage::default()
        }
    }
}

/// The task executor: drives one task through plan → execute → finalize,
/// with every lifecycle entry point the host needs.
///
/// State-mutating entry points serialize on the lifecycle mutex (FIFO via
/// tokio's fairness); `cancel`, `pause`, and `wrap_up` bypass it by design,
/// flipping signal flags the running loop observes at its suspension
/// points.
pub struct TaskExecutor {
    state: tokio::sync::Mutex<RunState>,
    signals: Arc<ControlSignals>,
    deps: ExecutorDeps,
    oracle: CompletionOracle,
}

impl TaskExecutor {
    pub fn new(task: Task, deps: ExecutorDeps) -> Self {
        let oracle = CompletionOracle::new(&task, deps.flags.clone());
        let state = RunState::new(task, &deps.flags);
        Self {
            state: tokio::sync::Mutex::new(state),
            signals: Arc::new(ControlSignals::new()),
            deps,
            oracle,
        }
    }

    /// Signals handle for hosts that deliver cancel/pause from another task.
    pub fn signals(&self) -> Arc<ControlSignals> {
        self.signals.clone()
    }

    /// Current budget counters (current continuation segment).
    pub async fn budget_usage(&self) -> crate::budget::BudgetUsage {
        *self.state.lock().await.budget.usage()
    }

    /// A copy of the task record as the executor sees it.
    pub async fn task(&self) -> Task {
        self.state.lock().await.task.clone()
    }

    // ── Non-mutex entry points ────────────────────────────────────────────────

    pub fn cancel(&self, reason: CancelReason) {
        info!(?reason, "task cancellation requested");
        self.signals.request_cancel(reason);
    }

    pub fn wrap_up(&self) {
        if self.signals.request_wrap_up() {
            info!("wrap-up requested; soft deadline reached");
        }
    }

    pub fn pause(&self) {
        self.signals.pause();
        self.deps.events.emit(TaskEvent::TaskPaused);
    }

    /// Clear the pause flag (counterpart of [`TaskExecutor::pause`]).
    pub fn unpause(&self) {
        self.signals.resume();
    }

    pub fn queue_follow_up(&self, text: impl Into<String>) {
        self.signals.queue_follow_up(text);
    }

    pub fn set_step_feedback(
        &self,
        step_id: impl Into<String>,
        action: StepFeedbackAction,
        message: Option<String>,
    ) {
        self.signals.push_feedback(StepFeedback { step_id: step_id.into(), action, message });
    }

    // ── Lifecycle entry points ────────────────────────────────────────────────

    /// Full plan/execute lifecycle.
    pub async fn execute(&self) -> TaskOutcome {
        let mut state = self.state.lock().await;
        state.task.status = TaskStatus::Executing;
        self.deps.events.emit(TaskEvent::Executing);

        if state.plan.is_none() {
            match self.create_plan(&mut state).await {
                Ok(plan) => {
                    self.deps.events.emit(TaskEvent::PlanCreated {
                        description: plan.description.clone(),
                        step_ids: plan.steps.iter().map(|s| s.id.clone()).collect(),
                    });
                    state.plan = Some(plan);
                }
                Err(e) => return self.conclude(&mut state, Err(e)).await,
            }
        }

        let result = self.run_plan(&mut state).await;
        self.conclude(&mut state, result).await
    }

    /// Continue after an `awaiting_user_input` pause.
    pub async fn resume(&self) -> TaskOutcome {
        self.signals.resume();
        let mut state = self.state.lock().await;
        state.task.status = TaskStatus::Executing;
        let result = self.run_plan(&mut state).await;
        self.conclude(&mut state, result).await
    }

    /// Install a plan restored from persisted events (used before
    /// [`TaskExecutor::resume_after_interruption`]).
    pub async fn set_plan(&self, plan: Plan) {
        let mut state = self.state.lock().await;
        state.plan = Some(plan);
    }

    /// Continue a snapshot-restored plan after a process restart.
    pub async fn resume_after_interruption(&self) -> TaskOutcome {
        let mut state = self.state.lock().await;
        state.task.status = TaskStatus::Executing;

        match self.deps.snapshots.latest(&state.task.id).await {
            Ok(Some(snapshot)) => match snapshot.restore_conversation() {
                Ok(log) => {
                    state.conversation = log;
                    state.gatekeeper.restore_fileops(snapshot.fileops.clone());
                    state.budget.restore_offsets(snapshot.usage);
                    info!(task_id = %state.task.id, "restored conversation from snapshot");
                }
                Err(e) => {
                    warn!("snapshot restore failed, rebuilding degraded context: {e}");
                    self.push_degraded_context(&mut state);
                }
            },
            Ok(None) => self.push_degraded_context(&mut state),
            Err(e) => {
                warn!("snapshot lookup failed, rebuilding degraded context: {e}");
                self.push_degraded_context(&mut state);
            }
        }

        let result = self.run_plan(&mut state).await;
        self.conclude(&mut state, result).await
    }

    /// Reset budget offsets (keeping cumulative totals) and retry pending
    /// steps after a turn/iteration limit.
    pub async fn continue_after_budget_exhausted(&self) -> TaskOutcome {
        let mut state = self.state.lock().await;
        state.budget.reset_for_continuation();
        self.signals.reset_for_continuation();
        self.deps.events.emit(TaskEvent::BudgetResetForContinuation);
        state.task.status = TaskStatus::Executing;

        // Failed and half-run steps from the exhausted segment get another
        // chance.
        if let Some(plan) = &mut state.plan {
            let ids: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| {
                    matches!(s.status, StepStatus::Failed | StepStatus::InProgress)
                })
                .map(|s| s.id.clone())
                .collect();
            for id in ids {
                plan.reset_step(&id);
            }
        }

        let result = self.run_plan(&mut state).await;
        self.conclude(&mut state, result).await
    }

    /// Append a follow-up message and run the follow-up loop.  If the task
    /// was paused mid-plan, the plan is re-dispatched afterwards.
    pub async fn send_message(&self, text: impl Into<String>) -> TaskOutcome {
        self.signals.resume();
        let mut state = self.state.lock().await;
        let prior_status = state.task.status;
        state.task.status = TaskStatus::Executing;

        let had_pending_plan = state
            .plan
            .as_ref()
            .map(|p| !p.is_finished())
            .unwrap_or(false);

        let follow_up_result = {
            let mut turn_loop =
                TurnLoop { state: &mut *state, deps: &self.deps, signals: &self.signals };
            turn_loop.run_follow_up(text.into()).await
        };

        match follow_up_result {
            Err(e) => self.conclude(&mut state, Err(e)).await,
            Ok(_) if had_pending_plan && prior_status == TaskStatus::Paused => {
                let result = self.run_plan(&mut state).await;
                self.conclude(&mut state, result).await
            }
            Ok(FollowUpOutcome::Worked) => self.conclude(&mut state, Ok(())).await,
            Ok(FollowUpOutcome::AnswerOnly) => {
                // Pure conversation: restore the prior non-executing status.
                state.task.status = if prior_status == TaskStatus::Executing {
                    TaskStatus::Completed
                } else {
                    prior_status
                };
                self.snapshot(&mut state).await;
                TaskOutcome {
                    status: state.task.status,
                    terminal_status: state.task.terminal_status,
                    failure_class: None,
                    result_summary: state.last_assistant_text.clone(),
                    warnings: Vec::new(),
                    usage: state.cumulative_usage(),
                }
            }
        }
    }

    // ── Planning ──────────────────────────────────────────────────────────────

    async fn create_plan(&self, state: &mut RunState) -> Result<Plan, ExecutorError> {
        state.task.status = TaskStatus::Planning;
        let playbook = self.deps.playbooks.playbook_for(&state.task.prompt).await;
        let mut prompt = format!(
            "Break this task into a short ordered plan. Reply with a JSON object \
             {{\"description\": string, \"steps\": [string]}} and nothing else.\n\nTask: {}",
            state.task.prompt
        );
        if let Some(criteria) = &state.task.success_criteria {
            prompt.push_str(&format!("\nSuccess criteria: {criteria}"));
        }
        if let Some(pb) = playbook {
            prompt.push_str(&format!("\n\nA previous successful approach:\n{pb}"));
        }

        let request = CompletionRequest {
            system: None,
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            max_tokens: Some(2048),
            stream: false,
        };
        let reply = match self.deps.provider.complete(request).await {
            Ok(stream) => match collect_response(stream, |_| {}).await {
                Ok(response) => {
                    state.budget.record_turn(&response.usage);
                    response.text()
                }
                Err(e) => {
                    warn!("plan call failed, using fallback plan: {e}");
                    String::new()
                }
            },
            Err(e) => {
                warn!("plan call failed, using fallback plan: {e}");
                String::new()
            }
        };
        state.task.status = TaskStatus::Executing;
        Ok(Plan::from_llm_json(&reply, &state.task.prompt))
    }

    // ── Plan execution ────────────────────────────────────────────────────────

    async fn run_plan(&self, state: &mut RunState) -> Result<(), ExecutorError> {
        loop {
            if let Some(reason) = self.signals.cancel_reason() {
                return Err(ExecutorError::Cancelled { reason });
            }
            if self.signals.wrap_up_requested() {
                return Ok(());
            }
            self.signals.wait_if_paused().await;

            // Drain follow-ups queued between steps.
            let queued = self.signals.drain_follow_ups();
            for follow_up in queued {
                state.conversation.push_user(follow_up.text);
            }

            // Pick up a step left in progress by a pause/interruption before
            // dispatching fresh pending work.
            let Some(step_id) = state.plan.as_ref().and_then(|p| {
                p.current_step().or_else(|| p.next_pending()).map(|s| s.id.clone())
            }) else {
                self.run_quality_passes(state).await?;
                return Ok(());
            };

            let outcome = {
                let mut turn_loop =
                    TurnLoop { state: &mut *state, deps: &self.deps, signals: &self.signals };
                turn_loop.run_step(&step_id).await
            };

            match outcome {
                Ok(StepOutcome::Completed) => {
                    state.plan.as_mut().unwrap().complete_step(&step_id);
                    if state.task.agent_config.progress_journal_enabled {
                        let entry = state
                            .plan
                            .as_ref()
                            .and_then(|p| p.step(&step_id))
                            .map(|s| format!("completed: {}", s.description))
                            .unwrap_or_default();
                        self.deps.events.emit(TaskEvent::ProgressJournal { entry });
                    }
                    self.deps.events.emit(TaskEvent::StepCompleted { step_id });
                }
                Ok(StepOutcome::Skipped) => {
                    state.plan.as_mut().unwrap().skip_step(&step_id);
                    self.deps.events.emit(TaskEvent::StepSkipped { step_id });
                }
                Ok(StepOutcome::Failed { error }) => {
                    self.handle_step_failure(state, &step_id, &error).await?;
                }
                Err(ExecutorError::StepTimeout { elapsed_ms, .. }) => {
                    let error = format!("step timed out after {elapsed_ms} ms");
                    self.handle_step_failure(state, &step_id, &error).await?;
                }
                Err(e) => return Err(e),
            }

            self.snapshot(state).await;
        }
    }

    /// Extra refinement turns over the final deliverable, once per task,
    /// when the config asks for more than one quality pass.
    async fn run_quality_passes(&self, state: &mut RunState) -> Result<(), ExecutorError> {
        let passes = state.task.agent_config.quality_passes.min(3);
        if passes <= 1 || state.quality_passes_done || state.last_assistant_text.is_none() {
            return Ok(());
        }
        state.quality_passes_done = true;
        for _ in 1..passes {
            if self.signals.wrap_up_requested() || self.signals.is_cancelled() {
                break;
            }
            let result = {
                let mut turn_loop =
                    TurnLoop { state: &mut *state, deps: &self.deps, signals: &self.signals };
                turn_loop
                    .run_follow_up(
                        "Review your final deliverable above for correctness, completeness, \
                         and clarity, and produce the improved version."
                            .to_string(),
                    )
                    .await
            };
            if let Err(e) = result {
                // Quality passes are best-effort polish: budget exhaustion
                // here must not fail an otherwise-finished task.
                warn!("quality pass ended early: {e}");
                break;
            }
        }
        Ok(())
    }

    async fn handle_step_failure(
        &self,
        state: &mut RunState,
        step_id: &str,
        error: &str,
    ) -> Result<(), ExecutorError> {
        state.plan.as_mut().unwrap().fail_step(step_id, error);
        self.deps.events.emit(TaskEvent::StepFailed {
            step_id: step_id.to_string(),
            error: error.to_string(),
        });

        // `stop` feedback failed the step on the user's order; wait for
        // their next instruction instead of auto-recovering around them.
        if error.contains("stopped by user") {
            return Err(ExecutorError::AwaitingUserInput { reason_code: "step_feedback_stop" });
        }

        let class = classify_failure(error);
        if class == RecoveryClass::UserBlocker {
            if state.task.agent_config.allow_user_input {
                self.deps.events.emit(TaskEvent::AwaitingUserInput {
                    reason_code: "user_blocker".into(),
                    question: error.to_string(),
                });
                self.signals.pause();
                self.deps.events.emit(TaskEvent::TaskPaused);
                return Err(ExecutorError::AwaitingUserInput { reason_code: "user_blocker" });
            }
            return Ok(()); // autonomous task: leave the step failed and move on
        }

        let description = state
            .plan
            .as_ref()
            .and_then(|p| p.step(step_id))
            .map(|s| s.description.clone())
            .unwrap_or_default();
        let signature = recovery_signature(class, &description);
        if !state.recovery.admit(&signature) {
            return Ok(());
        }
        if !state.budget.try_consume_recovery_slot() {
            return Ok(());
        }
        let steps =
            recovery_steps_for(class, &description, state.task.agent_config.deep_work_mode);
        if steps.is_empty() {
            return Ok(());
        }
        match state.plan.as_mut().unwrap().inject_recovery(step_id, steps) {
            Ok(ids) => {
                self.deps.events.emit(TaskEvent::StepRecoveryPlanned {
                    step_id: step_id.to_string(),
                    recovery_step_ids: ids,
                });
            }
            Err(rejection) => {
                self.deps.events.emit(TaskEvent::PlanRevisionBlocked {
                    reason: rejection.to_string(),
                });
            }
        }
        Ok(())
    }

    // ── Finalization ──────────────────────────────────────────────────────────

    /// Map the run result into a terminal task outcome, emitting the right
    /// events and writing the final snapshot.
    async fn conclude(
        &self,
        state: &mut RunState,
        result: Result<(), ExecutorError>,
    ) -> TaskOutcome {
        let outcome = match result {
            Ok(()) => {
                if self.signals.wrap_up_requested() {
                    self.finalize_best_effort(state)
                } else {
                    self.finalize(state).await
                }
            }
            Err(ExecutorError::AwaitingUserInput { .. }) => {
                state.task.status = TaskStatus::Paused;
                TaskOutcome {
                    status: TaskStatus::Paused,
                    terminal_status: None,
                    failure_class: None,
                    result_summary: state.last_assistant_text.clone(),
                    warnings: Vec::new(),
                    usage: state.cumulative_usage(),
                }
            }
            Err(ExecutorError::Cancelled { reason }) => {
                self.deps.events.emit(TaskEvent::TaskCancelled { reason });
                if reason == CancelReason::Timeout {
                    // Timeouts get a best-effort answer on the way out.
                    self.finalize_best_effort(state)
                } else {
                    state.task.status = TaskStatus::Cancelled;
                    TaskOutcome {
                        status: TaskStatus::Cancelled,
                        terminal_status: None,
                        failure_class: None,
                        result_summary: None,
                        warnings: Vec::new(),
                        usage: state.cumulative_usage(),
                    }
                }
            }
            Err(ExecutorError::BudgetExhausted { limit }) => {
                let action_hint = limit.continuable().then(|| "continue_task".to_string());
                self.deps.events.emit(TaskEvent::Error {
                    code: limit.code().to_string(),
                    message: format!("budget exhausted: {limit:?}"),
                    action_hint,
                });
                let eligible = {
                    let turn_loop = TurnLoop {
                        state: &mut *state,
                        deps: &self.deps,
                        signals: &self.signals,
                    };
                    turn_loop.cron_partial_success_eligible()
                };
                if eligible {
                    // Cron policy: budgets ran dry but the candidate answer
                    // covers the ask — land as partial success, not failure.
                    let mut outcome = self.finalize_best_effort(state);
                    outcome.terminal_status = Some(TerminalStatus::PartialSuccess);
                    outcome
                } else if self.signals.wrap_up_requested() {
                    self.finalize_best_effort(state)
                } else {
                    self.fail(state, FailureClass::BudgetExhausted)
                }
            }
            Err(e @ ExecutorError::CompletionGuard { .. }) => {
                if self.signals.wrap_up_requested() {
                    self.finalize_best_effort(state)
                } else {
                    self.deps.events.emit(TaskEvent::Error {
                        code: "COMPLETION_GUARD".into(),
                        message: e.to_string(),
                        action_hint: None,
                    });
                    self.fail(state, FailureClass::ContractError)
                }
            }
            Err(e) => {
                self.deps.events.emit(TaskEvent::Error {
                    code: "EXECUTOR_ERROR".into(),
                    message: e.to_string(),
                    action_hint: None,
                });
                if self.signals.wrap_up_requested() {
                    self.finalize_best_effort(state)
                } else {
                    self.fail(state, e.failure_class())
                }
            }
        };

        state.task.status = outcome.status;
        state.task.terminal_status = outcome.terminal_status;
        state.task.failure_class = outcome.failure_class;
        state.task.result_summary = outcome.result_summary.clone();
        state.task.usage = outcome.usage;

        if outcome.status == TaskStatus::Completed {
            self.deps.events.emit(TaskEvent::TaskCompleted {
                terminal_status: outcome
                    .terminal_status
                    .map(|t| format!("{t:?}").to_lowercase())
                    .unwrap_or_else(|| "ok".into()),
            });
            if let Some(summary) = &outcome.result_summary {
                self.deps.knowledge.record_fact(&state.task.id, summary).await;
            }
        }
        self.snapshot(state).await;
        outcome
    }

    async fn finalize(&self, state: &mut RunState) -> TaskOutcome {
        // "Completed with warnings": a finished plan whose only residue is
        // failed verification steps, or whose final step still completed,
        // tolerates the failures.  Anything else is a real failure.
        let mut warnings = Vec::new();
        if let Some(plan) = &state.plan {
            let failed: Vec<_> = plan.failed_steps();
            if !failed.is_empty() {
                let only_verification =
                    failed.iter().all(|s| s.kind == StepKind::Verification);
                let final_step_completed = plan
                    .steps
                    .last()
                    .map(|s| s.status == StepStatus::Completed)
                    .unwrap_or(false);
                if only_verification || final_step_completed {
                    warnings = failed.iter().map(|s| s.id.clone()).collect();
                } else {
                    return self.fail(state, FailureClass::ToolError);
                }
            }
        }
        state.warnings = warnings.clone();

        let candidate = state.last_assistant_text.clone();
        match self.oracle.check(candidate.as_deref(), &state.evidence) {
            Ok(()) => {
                let terminal = if warnings.is_empty() {
                    TerminalStatus::Ok
                } else {
                    TerminalStatus::PartialSuccess
                };
                let mut outcome = TaskOutcome::completed(terminal, candidate, state.cumulative_usage());
                outcome.warnings = warnings;
                outcome
            }
            Err(guard) => {
                warn!("completion guard rejected finalization: {guard}");
                self.deps.events.emit(TaskEvent::Error {
                    code: "COMPLETION_GUARD".into(),
                    message: guard.to_string(),
                    action_hint: None,
                });
                self.fail(state, FailureClass::ContractError)
            }
        }
    }

    /// Bypass the oracle: complete with the best text we have.  Used by
    /// wrap-up, timeout recovery, and the cron partial-success policy.
    fn finalize_best_effort(&self, state: &mut RunState) -> TaskOutcome {
        let candidate = state
            .last_assistant_text
            .clone()
            .or_else(|| state.last_non_verification_output.clone())
            .unwrap_or_else(|| {
                "The task ended before a complete answer was produced; partial progress \
                 is recorded in the conversation."
                    .to_string()
            });
        let terminal = if self.oracle.check(Some(&candidate), &state.evidence).is_ok()
            && state.warnings.is_empty()
        {
            TerminalStatus::Ok
        } else {
            TerminalStatus::PartialSuccess
        };
        let mut outcome =
            TaskOutcome::completed(terminal, Some(candidate), state.cumulative_usage());
        outcome.warnings = state.warnings.clone();
        outcome
    }

    fn fail(&self, state: &mut RunState, class: FailureClass) -> TaskOutcome {
        TaskOutcome::failed(class, state.last_assistant_text.clone(), state.cumulative_usage())
    }

    // ── Snapshots and degraded resume ─────────────────────────────────────────

    async fn snapshot(&self, state: &mut RunState) {
        write_task_snapshot(state, &self.deps).await;
    }

    fn push_degraded_context(&self, state: &mut RunState) {
        let summary = state.plan.as_ref().map(|p| p.summary()).unwrap_or_default();
        state.conversation.push_user(format!(
            "The previous session was interrupted and its conversation could not be \
             restored. Plan status:\n{summary}\nContinue from the first pending step."
        ));
    }
}

/// Write the current conversation snapshot and prune older ones.  Called
/// after every assistant turn and at terminal transitions; strictly
/// serialized behind the lifecycle mutex, so it always observes the latest
/// message mutation.  Never fatal.
pub(crate) async fn write_task_snapshot(state: &RunState, deps: &ExecutorDeps) {
    let snapshot = ConversationSnapshot {
        task_id: state.task.id.clone(),
        taken_at: Utc::now(),
        entries: state.conversation.entries().to_vec(),
        fileops: state.gatekeeper.fileops().clone(),
        plan_summary: state.plan.as_ref().map(|p| p.summary()).unwrap_or_default(),
        usage: state.budget.cumulative(),
    };
    let message_count = snapshot.entries.len();
    if let Err(e) = deps.snapshots.write(snapshot).await {
        warn!("snapshot write failed (non-fatal): {e}");
        return;
    }
    if let Err(e) = deps.snapshots.prune_old(&state.task.id).await {
        warn!("snapshot prune failed (non-fatal): {e}");
    }
    deps.events.emit(TaskEvent::ConversationSnapshot { message_count });
}

// Executor-level behavior is tested end-to-end in crate::tests.
