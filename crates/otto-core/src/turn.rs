// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::time::{Duration, Instant};

use otto_config::TaskDomain;
use otto_model::{
    collect_response, CompletionRequest, CompletionResponse, ContentBlock, Message, StopReason,
};
use tracing::{debug, warn};

use crate::budget::has_adequate_coverage;
use crate::conversation::PinnedTag;
use crate::detect::{LoopSignal, NudgeKind};
use crate::error::ExecutorError;
use crate::events::TaskEvent;
use crate::executor::{ExecutorDeps, RunState};
use crate::gatekeeper::{GateContext, GateOutcome};
use crate::plan::StepKind;
use crate::recovery::MAX_MAX_TOKENS_RECOVERIES;
use crate::selection::select_tool_schemas;
use crate::signals::{ControlSignals, StepFeedbackAction};
use crate::summarizer::CompactionSummarizer;

pub(crate) const MAX_STEP_ITERATIONS: u32 = 16;
pub(crate) const MAX_FOLLOW_UP_ITERATIONS: u32 = 20;
pub(crate) const STEP_TIMEOUT: Duration = Duration::from_secs(300);
pub(crate) const DEEP_WORK_STEP_TIMEOUT: Duration = Duration::from_secs(600);
const SOFT_DEADLINE_FRACTION: f64 = 0.9;
/// Turns where the gatekeeper skipped every call and the model produced no
/// text, tolerated before forcing a text-only turn.
const SKIPPED_TURN_THRESHOLD: u32 = 2;
/// Consecutive tool-bearing turns a follow-up may chain before tools are
/// locked and a text answer is forced.
const FOLLOW_UP_TOOL_LOCK_STREAK: u32 = 10;
/// Fraction of window slack granted to the compaction summary block.
const SUMMARY_SLACK_FRACTION: f64 = 0.6;
/// Minimum token growth between pre-compaction memory flushes.
const MEMORY_FLUSH_TOKEN_DELTA: usize = 8_000;

/// Tools that are never ranked out of the offered set.
const BUILTIN_TOOLS: [&str; 8] = [
    "read_file",
    "write_file",
    "edit_file",
    "list_directory",
    "run_command",
    "web_search",
    "web_fetch",
    "grep",
];

// Nudge texts are private wording; tests assert structure, not strings.
const NUDGE_LOOP_BREAK: &str = "You have repeated the same tool call on the same target several \
     times in a row. Change approach: use a different tool, a different target, or reason from \
     the results you already have.";
const NUDGE_LOW_PROGRESS: &str = "Repeated work against the same target is not producing \
     progress. Step back, state what you have learned, and take a different route.";
const NUDGE_STOP_REASON: &str = "Stop opening new tool work. Use your remaining budget to write \
     the direct answer to the task as plain text.";
const NUDGE_SOFT_LANDING: &str = "Turn budget is nearly exhausted. Do not start new exploratory \
     work; consolidate what you have and produce the final deliverable now.";
const CONTINUE_AFTER_TRUNCATION: &str = "Your previous reply was cut off at the output limit. \
     Continue exactly where you stopped, without repeating earlier content.";

/// How one step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Completed,
    Skipped,
    Failed { error: String },
}

/// How a follow-up run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FollowUpOutcome {
    /// Tool calls ran or iterations were exhausted — the task re-completes.
    Worked,
    /// Pure conversation; restore the prior non-executing status.
    AnswerOnly,
}

/// Result of one model call inside the loop.
enum CallResult {
    Response(CompletionResponse),
    /// The in-flight call was aborted by wrap-up or the soft step deadline.
    SoftAborted,
}

struct StepClock {
    started: Instant,
    soft: Instant,
    hard: Instant,
    soft_fired: bool,
}

impl StepClock {
    fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            soft: started + timeout.mul_f64(SOFT_DEADLINE_FRACTION),
            hard: started + timeout,
            soft_fired: false,
        }
    }

    fn hard_remaining(&self) -> Option<Duration> {
        self.hard.checked_duration_since(Instant::now())
    }
}

/// The per-step / per-follow-up turn loop.
pub(crate) struct TurnLoop<'a> {
    pub state: &'a mut RunState,
    pub deps: &'a ExecutorDeps,
    pub signals: &'a ControlSignals,
}

impl TurnLoop<'_> {
    // ── Step driver ───────────────────────────────────────────────────────────

    pub async fn run_step(&mut self, step_id: &str) -> Result<StepOutcome, ExecutorError> {
        let (description, kind) = {
            let plan = self.state.plan.as_mut().expect("run_step without a plan");
            plan.start_step(step_id);
            let step = plan.step(step_id).expect("step exists");
            (step.description.clone(), step.kind)
        };
        self.deps.events.emit(TaskEvent::StepStarted {
            step_id: step_id.to_string(),
            description: description.clone(),
        });

        self.state.detector.reset_for_step();
        self.state.budget.reset_step_oneshots();
        self.state.tool_selection_epoch += 1;

        let step_message = self.build_step_message(&description, kind);
        self.state.conversation.push_user(step_message);

        let timeout = if self.state.task.agent_config.deep_work_mode {
            DEEP_WORK_STEP_TIMEOUT
        } else {
            STEP_TIMEOUT
        };
        let mut clock = StepClock::new(timeout);

        let outcome = self
            .drive_loop(Some(step_id.to_string()), kind, MAX_STEP_ITERATIONS, &mut clock)
            .await?;

        // Step-dominance bookkeeping for the consecutive-search budget.
        let was_search = self.state.step_search_calls > self.state.step_other_calls;
        self.state.budget.note_step_search_dominated(was_search);
        self.state.step_search_calls = 0;
        self.state.step_other_calls = 0;

        if outcome != StepOutcome::Completed {
            return Ok(outcome);
        }
        Ok(self.evaluate_step_contracts(&description, kind))
    }

    pub async fn run_follow_up(&mut self, text: String) -> Result<FollowUpOutcome, ExecutorError> {
        self.state.detector.reset_for_step();
        self.state.budget.reset_step_oneshots();
        self.state.conversation.push_user(text);

        let mut clock = StepClock::new(STEP_TIMEOUT);
        let tool_calls_before = self.state.budget.usage().tool_calls;
        let outcome = self
            .drive_loop(None, StepKind::Primary, MAX_FOLLOW_UP_ITERATIONS, &mut clock)
            .await?;

        let ran_tools = self.state.budget.usage().tool_calls > tool_calls_before;
        match outcome {
            StepOutcome::Failed { .. } | StepOutcome::Completed | StepOutcome::Skipped => {
                if ran_tools {
                    Ok(FollowUpOutcome::Worked)
                } else {
                    Ok(FollowUpOutcome::AnswerOnly)
                }
            }
        }
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    async fn drive_loop(
        &mut self,
        step_id: Option<String>,
        step_kind: StepKind,
        max_iterations: u32,
        clock: &mut StepClock,
    ) -> Result<StepOutcome, ExecutorError> {
        let mut iterations = 0u32;
        let mut max_tokens_recoveries = 0u32;
        let mut skipped_tool_only_turns = 0u32;
        let mut consecutive_tool_turns = 0u32;
        let mut force_text_only = false;
        let mut call_attempt = 0u32;

        loop {
            // Cancellation and pause are observed at every boundary.
            if let Some(reason) = self.signals.cancel_reason() {
                return Err(ExecutorError::Cancelled { reason });
            }
            self.signals.wait_if_paused().await;
            if self.signals.wrap_up_requested() {
                return Ok(StepOutcome::Completed);
            }
            if clock.hard_remaining().is_none() {
                let id = step_id.clone().unwrap_or_else(|| "follow-up".into());
                return Err(ExecutorError::StepTimeout {
                    step_id: id,
                    elapsed_ms: clock.started.elapsed().as_millis() as u64,
                });
            }
            if iterations >= max_iterations {
                debug!(iterations, "iteration budget exhausted; accepting best output");
                return Ok(StepOutcome::Completed);
            }

            // a. Drain queued follow-ups and step feedback.
            for follow_up in self.signals.drain_follow_ups() {
                self.state.conversation.push_user(follow_up.text);
            }
            if let Some(step_id) = &step_id {
                for fb in self.signals.drain_feedback() {
                    if &fb.step_id != step_id {
                        continue;
                    }
                    self.deps.events.emit(TaskEvent::StepFeedback {
                        step_id: step_id.clone(),
                        action: format!("{:?}", fb.action).to_lowercase(),
                    });
                    match fb.action {
                        StepFeedbackAction::Skip => return Ok(StepOutcome::Skipped),
                        StepFeedbackAction::Stop => {
                            self.signals.pause();
                            self.deps.events.emit(TaskEvent::TaskPaused);
                            return Ok(StepOutcome::Failed {
                                error: "stopped by user feedback".into(),
                            });
                        }
                        StepFeedbackAction::Retry => {
                            iterations = 0;
                            self.state.detector.reset_for_step();
                        }
                        StepFeedbackAction::Drift => {
                            if let Some(msg) = fb.message {
                                self.state.conversation.push_user(msg);
                            }
                        }
                    }
                }
            }

            // b. Soft landing when the turn budget is nearly gone.
            if self.state.budget.should_inject_soft_landing() {
                self.deps.events.emit(TaskEvent::BudgetSoftLanding {
                    remaining_turns: self.state.budget.remaining_turns(),
                });
                self.state.conversation.push_user(NUDGE_SOFT_LANDING);
            }

            // c. Pinned context blocks.
            self.upsert_pinned_blocks().await;

            // d. Pre-compaction memory flush (rate-limited by token growth).
            self.maybe_flush_memory().await;

            // e. Compaction (proactive).
            self.run_compaction(false).await;

            // f. History hygiene before the call.
            self.state.conversation.prune_stale_tool_errors();
            self.state.conversation.consolidate_consecutive_user();

            // g. The model call.  Attempt deadlines and transient provider
            // failures retry with decayed limits; anything past that fails
            // the step.
            let wants_tools = !force_text_only;
            let result = match self.call_model(wants_tools, call_attempt, clock).await {
                Ok(r) => r,
                Err(ExecutorError::Provider(e)) if call_attempt < 2 => {
                    call_attempt += 1;
                    warn!(attempt = call_attempt, "model call failed, retrying: {e}");
                    self.deps.events.emit(TaskEvent::LlmRetry {
                        attempt: call_attempt,
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let response = match result {
                CallResult::SoftAborted => return Ok(StepOutcome::Completed),
                CallResult::Response(r) => r,
            };
            call_attempt = 0;

            // h. Stop-reason handling: truncation recovery first.
            if response.stop_reason == StopReason::MaxTokens {
                self.deps.events.emit(TaskEvent::MaxTokensRecovery {
                    attempt: max_tokens_recoveries + 1,
                });
                self.absorb_truncated_response(&response);
                if max_tokens_recoveries < MAX_MAX_TOKENS_RECOVERIES {
                    max_tokens_recoveries += 1;
                    self.state.conversation.push_user(CONTINUE_AFTER_TRUNCATION);
                    // Iteration counter intentionally not advanced here.
                    continue;
                }
                return Ok(StepOutcome::Failed {
                    error: "response repeatedly truncated at the output limit".into(),
                });
            }
            max_tokens_recoveries = 0;
            iterations += 1;
            self.state.budget.record_turn(&response.usage);
            self.deps.events.emit(TaskEvent::LlmUsage(response.usage));

            // i. Assistant text processing.
            let text = sanitize_assistant_text(&response.text());
            if !text.is_empty() {
                self.state.last_assistant_text = Some(text.clone());
                if step_kind != StepKind::Verification {
                    self.state.last_non_verification_output = Some(text.clone());
                }
                self.deps.events.emit(TaskEvent::AssistantMessage { text: text.clone() });
            }

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            if tool_uses.is_empty() {
                consecutive_tool_turns = 0;
                self.state.conversation.push_assistant(text.clone());

                // m. Required-decision pause.
                if self.should_pause_for_question(&text) {
                    self.deps.events.emit(TaskEvent::AwaitingUserInput {
                        reason_code: "required_decision".into(),
                        question: text,
                    });
                    self.signals.pause();
                    self.deps.events.emit(TaskEvent::TaskPaused);
                    return Err(ExecutorError::AwaitingUserInput {
                        reason_code: "required_decision",
                    });
                }

                if response.stop_reason == StopReason::EndTurn && !text.is_empty() {
                    self.state.detector.note_stop_reason(StopReason::EndTurn);
                    return Ok(StepOutcome::Completed);
                }
                // Empty turn: nudge the model onward rather than burning the
                // step (thinking-only responses land here).
                if text.is_empty() {
                    self.state
                        .conversation
                        .push_user("Continue with your next action or state your result.");
                }
                continue;
            }

            // j. Tool phase: push the assistant message, gate every call,
            // answer all of them in one user message, in order.
            consecutive_tool_turns += 1;
            if step_id.is_none() && consecutive_tool_turns >= FOLLOW_UP_TOOL_LOCK_STREAK {
                // Follow-ups that keep chaining tools never hand the answer
                // back; lock tools so the next turn must be text.
                force_text_only = true;
            }
            self.state.conversation.push(Message::assistant_blocks(response.content.clone()));
            let outcomes = self.run_tool_phase(&tool_uses, clock).await;

            // k/l. Post-turn nudges and the all-blocked failure decision.
            if let Some(outcome) = self.post_turn_adjustments(&tool_uses, &outcomes, &response)
            {
                return Ok(outcome);
            }

            // n. Skipped tool-only turns: every call skipped, no text.
            let all_skipped =
                outcomes.iter().all(|o| matches!(o, GateOutcome::Rejected { .. }));
            if all_skipped && text.is_empty() {
                skipped_tool_only_turns += 1;
                let threshold = match self.state.task.agent_config.task_domain {
                    TaskDomain::Research => SKIPPED_TURN_THRESHOLD + 1,
                    _ => SKIPPED_TURN_THRESHOLD,
                };
                if skipped_tool_only_turns >= threshold {
                    force_text_only = true;
                }
            } else {
                skipped_tool_only_turns = 0;
            }

            // Snapshot after the turn's messages (assistant blocks + tool
            // results) are all in place.
            crate::executor::write_task_snapshot(self.state, self.deps).await;
        }
    }

    // ── Model call ────────────────────────────────────────────────────────────

    async fn call_model(
        &mut self,
        wants_tools: bool,
        attempt: u32,
        clock: &mut StepClock,
    ) -> Result<CallResult, ExecutorError> {
        self.state.budget.record_iteration();
        self.state.budget.check_before_llm_call()?;

        let system = self.system_prompt();
        let system_tokens = system.len() / 4;
        let window = self.deps.provider.context_window();

        // Reactive compaction: the estimate says this call would not fit.
        if self.state.conversation.token_estimate(system_tokens) >= window {
            self.run_compaction(true).await;
        }

        let limits = self.state.budget.call_attempt_limits(
            self.deps.provider.max_output_tokens() as u32,
            attempt,
            wants_tools,
        );
        let tools = if wants_tools { self.offered_tools() } else { Vec::new() };
        let request = CompletionRequest {
            system: Some(system),
            messages: self.state.conversation.messages(),
            tools,
            max_tokens: Some(limits.max_tokens),
            stream: true,
        };

        let token = self.signals.current_token();
        let started = Instant::now();
        let stream = match self.deps.provider.complete(request.clone()).await {
            Ok(s) => s,
            Err(e) if is_context_overflow(&e) => {
                warn!("provider rejected the call for context size; compacting and retrying once");
                self.run_compaction(true).await;
                let retry = CompletionRequest {
                    messages: self.state.conversation.messages(),
                    ..request.clone()
                };
                self.deps.provider.complete(retry).await?
            }
            Err(e) => return Err(ExecutorError::Provider(e)),
        };

        let call_timeout = match clock.hard_remaining() {
            Some(remaining) => limits.timeout.min(remaining),
            None => Duration::from_millis(1),
        };

        enum Sel {
            Aborted,
            SoftDeadline,
            Finished(Result<anyhow::Result<CompletionResponse>, tokio::time::error::Elapsed>),
        }

        let mut streamed_chars = 0usize;
        let soft_sleep_target = tokio::time::Instant::from_std(clock.soft);
        let soft_armed = !clock.soft_fired;
        let sel = tokio::select! {
            biased;
            _ = token.cancelled() => Sel::Aborted,
            _ = tokio::time::sleep_until(soft_sleep_target), if soft_armed => Sel::SoftDeadline,
            result = tokio::time::timeout(
                call_timeout,
                collect_response(stream, |delta| streamed_chars += delta.len()),
            ) => Sel::Finished(result),
        };

        let response = match sel {
            Sel::SoftDeadline => {
                clock.soft_fired = true;
                self.signals.request_wrap_up();
                return Ok(CallResult::SoftAborted);
            }
            Sel::Aborted => {
                // Aborted by cancel or wrap-up: close any half-open state and
                // let the caller decide.
                if let Some(reason) = self.signals.cancel_reason() {
                    return Err(ExecutorError::Cancelled { reason });
                }
                return Ok(CallResult::SoftAborted);
            }
            Sel::Finished(Err(_elapsed)) => {
                // Attempt deadline: abort the stream and let the caller retry
                // with decayed limits on the next iteration.
                self.signals.abort_and_refresh();
                return Err(ExecutorError::Provider(anyhow::anyhow!(
                    "model call exceeded its {}s attempt deadline",
                    call_timeout.as_secs()
                )));
            }
            Sel::Finished(Ok(Err(e))) => return Err(ExecutorError::Provider(e)),
            Sel::Finished(Ok(Ok(response))) => response,
        };

        if streamed_chars > 0 {
            self.deps.events.emit(TaskEvent::LlmStreaming { chars: streamed_chars });
        }
        self.state.budget.observe_tps(response.usage.output_tokens, started.elapsed());
        self.state
            .conversation
            .estimator_mut()
            .calibrate(response.usage.input_tokens, request_estimate(&request));
        Ok(CallResult::Response(response))
    }

    fn offered_tools(&self) -> Vec<otto_model::ToolSchema> {
        let config = &self.state.task.agent_config;
        let schemas: Vec<otto_tools::ToolSchema> = self
            .deps
            .registry
            .schemas()
            .into_iter()
            .filter(|s| config.tool_allowed(&s.name))
            .collect();
        let builtins: HashSet<String> = BUILTIN_TOOLS.iter().map(|s| s.to_string()).collect();
        let context = format!(
            "{} {} {}",
            self.state.task.prompt,
            self.state.current_step_description().unwrap_or_default(),
            self.state.last_assistant_text.as_deref().unwrap_or(""),
        );
        select_tool_schemas(
            schemas,
            &builtins,
            &context,
            &self.state.tool_usage_counts,
            &self.state.task.id,
            self.state.tool_selection_epoch,
        )
        .into_iter()
        .map(|s| otto_model::ToolSchema {
            name: s.name,
            description: s.description,
            input_schema: s.input_schema,
        })
        .collect()
    }

    // ── Tool phase ────────────────────────────────────────────────────────────

    async fn run_tool_phase(
        &mut self,
        tool_uses: &[(String, String, serde_json::Value)],
        clock: &StepClock,
    ) -> Vec<GateOutcome> {
        let mut outcomes = Vec::with_capacity(tool_uses.len());
        let recent_text = self.state.last_assistant_text.clone();
        for (call_id, name, input) in tool_uses {
            let gate = GateContext {
                config: &self.state.task.agent_config,
                flags: &self.deps.flags,
                registry: &self.deps.registry,
                events: self.deps.events.clone(),
                citations: self.deps.citations.as_ref(),
                token: self.signals.current_token(),
                step_remaining: clock.hard_remaining(),
                recent_assistant_text: recent_text.clone(),
                provider: Some(self.deps.provider.clone()),
            };
            let outcome = self
                .state
                .gatekeeper
                .process_call(call_id, name, input.clone(), &mut self.state.budget, &gate)
                .await;

            match &outcome {
                GateOutcome::Executed { output, .. } => {
                    *self.state.tool_usage_counts.entry(name.clone()).or_insert(0) += 1;
                    self.note_step_category(name, input);
                    self.update_evidence(name, input, output.is_error);
                }
                GateOutcome::Rejected { reason, .. } => {
                    self.deps.events.emit(TaskEvent::ToolBlocked {
                        tool: name.clone(),
                        call_id: call_id.clone(),
                        reason: reason.label().to_string(),
                    });
                }
            }
            outcomes.push(outcome);
        }

        // Answer every tool_use in one user message, preserving order.
        let results: Vec<ContentBlock> = tool_uses
            .iter()
            .zip(outcomes.iter())
            .map(|((id, _, _), outcome)| {
                let out = outcome.output();
                ContentBlock::tool_result(id.clone(), out.content.clone(), out.is_error)
            })
            .collect();
        self.state.conversation.push(Message::tool_results(results));

        // Side handlers: tools may request a plan revision or a workspace
        // switch through their output.
        for outcome in &outcomes {
            if let GateOutcome::Executed { output, .. } = outcome {
                if !output.is_error {
                    self.apply_side_requests(&output.content);
                }
            }
        }
        outcomes
    }

    /// Honor structured requests embedded in successful tool output.
    fn apply_side_requests(&mut self, content: &str) {
        for line in content.lines() {
            if let Some(payload) = line.trim().strip_prefix("PLAN_REVISION_REQUEST:") {
                let Ok(req) = serde_json::from_str::<serde_json::Value>(payload.trim()) else {
                    continue;
                };
                let steps: Vec<String> = req["steps"]
                    .as_array()
                    .map(|a| {
                        a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()
                    })
                    .unwrap_or_default();
                if steps.is_empty() {
                    continue;
                }
                let reason = req["reason"].as_str().unwrap_or("tool-requested revision");
                let clear = req["clear_remaining"].as_bool().unwrap_or(false);
                let Some(plan) = self.state.plan.as_mut() else { continue };
                match plan.revise(steps, reason, clear) {
                    Ok(ids) => self.deps.events.emit(TaskEvent::PlanRevised {
                        reason: reason.to_string(),
                        step_count: ids.len(),
                    }),
                    Err(rejection) => self.deps.events.emit(TaskEvent::PlanRevisionBlocked {
                        reason: rejection.to_string(),
                    }),
                }
            } else if let Some(workspace) = line.trim().strip_prefix("WORKSPACE_SWITCH_REQUEST:")
            {
                let workspace = workspace.trim().to_string();
                if workspace.is_empty() {
                    continue;
                }
                self.state.task.workspace = Some(workspace.clone());
                self.deps.events.emit(TaskEvent::WorkspaceSwitched { workspace: workspace.clone() });
                self.deps
                    .events
                    .emit(TaskEvent::WorkspacePermissionsUpdated { workspace });
            }
        }
    }

    fn note_step_category(&mut self, name: &str, input: &serde_json::Value) {
        let category = crate::detect::normalize_category(name, input);
        if category == "search" || name == "web_search" {
            self.state.step_search_calls += 1;
        } else {
            self.state.step_other_calls += 1;
        }
    }

    fn update_evidence(&mut self, name: &str, input: &serde_json::Value, is_error: bool) {
        if is_error {
            return;
        }
        let tool = self.deps.registry.get(name);
        let is_execution = matches!(
            tool.as_ref().map(|t| t.kind()),
            Some(otto_tools::ToolKind::Command) | Some(otto_tools::ToolKind::ChildAgent)
        ) || matches!(name, "run_command" | "shell" | "run_applescript");
        if is_execution {
            self.state.evidence.execution_succeeded = true;
        }
        if tool.map(|t| t.is_mutating()).unwrap_or(false) {
            if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                self.state.evidence.artifacts.push(path.to_string());
                self.deps.events.emit(TaskEvent::ArtifactCreated { path: path.to_string() });
            }
        }
        let dated = self.deps.citations.dated_source_count();
        if dated > self.state.evidence.dated_sources {
            self.state.evidence.dated_sources = dated;
            self.deps.events.emit(TaskEvent::CitationsCollected {
                count: self.deps.citations.source_count(),
            });
        }
    }

    // ── Post-turn adjustments ─────────────────────────────────────────────────

    /// Apply the one-shot nudges in their canonical order, then the
    /// all-blocked failure decision.  Returns a terminal outcome when the
    /// step must stop.
    fn post_turn_adjustments(
        &mut self,
        tool_uses: &[(String, String, serde_json::Value)],
        outcomes: &[GateOutcome],
        response: &CompletionResponse,
    ) -> Option<StepOutcome> {
        // Feed the detector with this turn's calls.
        let mut signals = Vec::new();
        for ((_, name, input), outcome) in tool_uses.iter().zip(outcomes.iter()) {
            let progressed = match outcome {
                GateOutcome::Executed { output, .. } => !output.is_error,
                GateOutcome::Rejected { .. } => false,
            };
            if let Some(signal) = self.state.detector.record_call(name, input, progressed) {
                signals.push(signal);
            }
        }

        // Tool-loop nudge.
        if let Some(LoopSignal::ToolLoop { category, signature }) = signals
            .iter()
            .find(|s| matches!(s, LoopSignal::ToolLoop { .. }))
            .cloned()
        {
            if self.state.detector.try_fire(NudgeKind::LoopBreak) {
                self.deps.events.emit(TaskEvent::ToolLoopDetected { category, signature });
                self.state.conversation.push_user(NUDGE_LOOP_BREAK);
            }
        }

        // Low-progress nudge.
        if let Some(LoopSignal::LowProgress { target }) = signals
            .iter()
            .find(|s| matches!(s, LoopSignal::LowProgress { .. }))
            .cloned()
        {
            if self.state.detector.try_fire(NudgeKind::LowProgress) {
                self.deps.events.emit(TaskEvent::LowProgressLoopDetected { target });
                self.state.conversation.push_user(NUDGE_LOW_PROGRESS);
            }
        }

        // Varied-failure nudge.
        if let Some((tool, failures)) = self.state.gatekeeper.varied().worst_offender() {
            if self.state.detector.try_fire(NudgeKind::VariedFailure) {
                self.deps.events.emit(TaskEvent::VariedFailureLoopDetected {
                    tool: tool.clone(),
                    failures,
                });
                self.state.conversation.push_user(format!(
                    "Tool {tool} has failed {failures} times this run. Stop relying on it; \
                     produce the deliverable as text or use a different tool."
                ));
            }
        }

        // Stop-reason nudge.
        if let Some(LoopSignal::StopReasonStreak { stop_reason, streak }) =
            self.state.detector.note_stop_reason(response.stop_reason)
        {
            if self.state.detector.try_fire(NudgeKind::StopReason) {
                self.deps.events.emit(TaskEvent::StopReasonNudge {
                    stop_reason: format!("{stop_reason:?}").to_lowercase(),
                    streak,
                });
                self.state.conversation.push_user(NUDGE_STOP_REASON);
            }
        }

        // Tool-recovery hint, then the failure decision: when every attempt
        // this turn was blocked, hint once; a second fully-blocked turn
        // fails the step.
        let all_blocked = !outcomes.is_empty() && outcomes.iter().all(|o| o.is_blocking());
        if all_blocked {
            if self.state.detector.try_fire(NudgeKind::ToolRecovery) {
                let blockers: Vec<String> = outcomes
                    .iter()
                    .map(|o| match o {
                        GateOutcome::Rejected { reason, .. } => reason.label().to_string(),
                        GateOutcome::Executed { .. } => "hard_failure".to_string(),
                    })
                    .collect();
                self.deps.events.emit(TaskEvent::ToolRecoveryPrompted {
                    blockers: blockers.clone(),
                });
                self.state.conversation.push_user(format!(
                    "Every tool call this turn was blocked ({}). Switch strategy: use \
                     different tools, different inputs, or answer from what you already \
                     know.",
                    blockers.join(", ")
                ));
            } else {
                return Some(StepOutcome::Failed {
                    error: "all tool attempts blocked after a recovery hint".into(),
                });
            }
        }
        None
    }

    // ── Contracts ─────────────────────────────────────────────────────────────

    fn evaluate_step_contracts(&mut self, description: &str, kind: StepKind) -> StepOutcome {
        let contract = self.state.contract;
        if contract.requires_execution_evidence
            && kind == StepKind::Primary
            && mentions_execution(description)
            && !self.state.evidence.execution_succeeded
        {
            return StepOutcome::Failed {
                error: "step demanded execution but no execution tool call succeeded".into(),
            };
        }
        if contract.requires_artifact_evidence
            && kind == StepKind::Primary
            && mentions_artifact(description)
            && self.state.evidence.artifacts.is_empty()
        {
            return StepOutcome::Failed {
                error: "step demanded an artifact but none was created".into(),
            };
        }
        if kind == StepKind::Primary
            && mentions_image_artifact(description)
            && !self.state.evidence.artifacts.iter().any(|p| is_image_path(p))
        {
            return StepOutcome::Failed {
                error: "step demanded a screenshot or image but none was produced".into(),
            };
        }
        if kind == StepKind::Verification {
            let text = self.state.last_assistant_text.as_deref().unwrap_or("");
            match verification_signal(text) {
                Some(ok) => {
                    self.state.evidence.verification_concluded = true;
                    if !ok {
                        return StepOutcome::Failed {
                            error: "verification reported problems".into(),
                        };
                    }
                }
                None => {
                    return StepOutcome::Failed {
                        error: "verification step ended without an OK signal or problem list"
                            .into(),
                    };
                }
            }
        }
        StepOutcome::Completed
    }

    // ── Context construction ──────────────────────────────────────────────────

    fn build_step_message(&self, description: &str, kind: StepKind) -> String {
        let mut out = format!("Current step: {description}\n\nTask: {}", self.state.task.prompt);
        if let Some(criteria) = &self.state.task.success_criteria {
            out.push_str(&format!("\nSuccess criteria: {criteria}"));
        }
        if let Some(plan) = &self.state.plan {
            let completed: Vec<String> = plan
                .completed_steps()
                .iter()
                .map(|s| format!("- {}", s.description))
                .collect();
            if !completed.is_empty() {
                out.push_str(&format!("\n\nAlready completed:\n{}", completed.join("\n")));
            }
        }
        let warnings = self.state.gatekeeper.cross_step().warnings();
        if !warnings.is_empty() {
            let lines: Vec<String> = warnings
                .iter()
                .map(|(tool, n)| format!("- {tool} has failed {n} time(s); prefer alternatives"))
                .collect();
            out.push_str(&format!("\n\nTool reliability warnings:\n{}", lines.join("\n")));
        }
        let files = self.state.gatekeeper.fileops().files_read();
        if !files.is_empty() {
            out.push_str(&format!("\n\nFiles already read: {}", files.join(", ")));
        }
        if let Some(prev) = &self.state.last_non_verification_output {
            let clamp = crate::compact::smart_truncate(
                prev,
                otto_tools::OutputCategory::Generic,
                200,
            );
            out.push_str(&format!("\n\nMost recent output:\n{clamp}"));
        }
        if kind == StepKind::Verification {
            out.push_str(
                "\n\nThis is a verification step. Inspect the work above and respond with \
                 exactly 'OK' if everything is correct, or a list of concrete problems if not.",
            );
        }
        out
    }

    fn system_prompt(&self) -> String {
        let task = &self.state.task;
        let config = &task.agent_config;
        format!(
            "You are an autonomous task executor working on: {}\n\
             Execution mode: {:?}. Task domain: {:?}.\n\
             Work step by step, call tools when they help, and finish with a direct, \
             complete answer to the task.",
            task.title, config.execution_mode, config.task_domain
        )
    }

    // ── Pinned blocks, memory, compaction ─────────────────────────────────────

    async fn upsert_pinned_blocks(&mut self) {
        if let Some(profile) = &self.deps.user_profile {
            self.state.conversation.upsert_pinned(PinnedTag::UserProfile, profile.clone());
        }
        if self.state.task.agent_config.allow_shared_context_memory {
            if let Some(shared) = &self.deps.shared_context {
                self.state.conversation.upsert_pinned(PinnedTag::SharedContext, shared.clone());
            }
        }
        if self.state.task.agent_config.retain_memory && !self.state.memory_recall_done {
            self.state.memory_recall_done = true;
            if let Some(recall) = self.deps.memory.recall(&self.state.task.prompt).await {
                self.state.conversation.upsert_pinned(PinnedTag::MemoryRecall, recall);
            }
        }
    }

    async fn maybe_flush_memory(&mut self) {
        if !self.state.task.agent_config.retain_memory {
            return;
        }
        let tokens = self.state.conversation.token_estimate(0);
        if tokens < self.state.last_memory_flush_tokens + MEMORY_FLUSH_TOKEN_DELTA {
            return;
        }
        self.state.last_memory_flush_tokens = tokens;
        if let Some(text) = &self.state.last_assistant_text {
            self.deps.memory.store_summary(&self.state.task.id, text).await;
        }
    }

    pub(crate) async fn run_compaction(&mut self, force: bool) {
        let system_tokens = self.system_prompt().len() / 4;
        let window = self.deps.provider.context_window();
        let Some(outcome) =
            self.state.conversation.compact_with_meta(system_tokens, window, force)
        else {
            return;
        };
        let slack = window.saturating_sub(outcome.tokens_after);
        let budget = ((slack as f64) * SUMMARY_SLACK_FRACTION) as usize;
        let summarizer = CompactionSummarizer::new(self.deps.provider.clone());
        let summary = summarizer.summarize(&outcome.removed, budget).await;
        self.state.conversation.upsert_pinned(PinnedTag::CompactionSummary, summary);
        self.deps.events.emit(TaskEvent::ContextSummarized {
            tokens_before: outcome.tokens_before,
            tokens_after: self.state.conversation.token_estimate(system_tokens),
            proactive: outcome.proactive,
        });
    }

    // ── Odds and ends ─────────────────────────────────────────────────────────

    /// Store the truncated response without breaking pairing: any tool_use
    /// in it gets a synthetic error result.
    fn absorb_truncated_response(&mut self, response: &CompletionResponse) {
        if response.content.is_empty() {
            return;
        }
        self.state.conversation.push(Message::assistant_blocks(response.content.clone()));
        self.state
            .conversation
            .close_hanging_tool_uses("tool call interrupted by output truncation");
    }

    fn should_pause_for_question(&self, text: &str) -> bool {
        let config = &self.state.task.agent_config;
        config.allow_user_input
            && config.pause_for_required_decision
            && !config.autonomous_mode
            && is_blocking_question(text)
    }

    /// Whether the best candidate answer justifies partial success when a
    /// cron task runs out of budget.
    pub(crate) fn cron_partial_success_eligible(&self) -> bool {
        self.deps.flags.partial_success_for_cron
            && self.state.task.source == crate::task::TaskSource::Cron
            && self
                .state
                .last_assistant_text
                .as_deref()
                .map(has_adequate_coverage)
                .unwrap_or(false)
    }
}

fn request_estimate(request: &CompletionRequest) -> usize {
    let msg_tokens: usize = request.messages.iter().map(|m| m.approx_tokens()).sum();
    msg_tokens + request.system.as_deref().map(|s| s.len() / 4).unwrap_or(0)
}

fn is_context_overflow(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    (msg.contains("context") && (msg.contains("exceed") || msg.contains("too long")))
        || msg.contains("maximum context length")
        || msg.contains("prompt is too long")
}

/// Strip tool-call-shaped markup some models write into plain text instead
/// of using the structured protocol.
fn sanitize_assistant_text(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in [("<tool_call>", "</tool_call>"), ("<function=", "</function>")] {
        while let (Some(start), Some(end)) = (out.find(open), out.find(close)) {
            if end <= start {
                break;
            }
            out.replace_range(start..end + close.len(), "");
        }
    }
    out.trim().to_string()
}

/// A blocking question: the reply ends by asking the user to pick or
/// confirm something.
fn is_blocking_question(text: &str) -> bool {
    let trimmed = text.trim();
    if !trimmed.ends_with('?') {
        return false;
    }
    let last_line = trimmed.lines().last().unwrap_or("").to_lowercase();
    last_line.contains(" or ")
        || last_line.contains("which ")
        || last_line.contains("should i")
        || last_line.contains("do you want")
        || last_line.contains("confirm")
}

/// Parse a verification step's closing text: `Some(true)` for an OK signal,
/// `Some(false)` for a concrete problem list, `None` for neither.
fn verification_signal(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if lower == "ok"
        || lower.starts_with("ok.")
        || lower.starts_with("ok —")
        || lower.starts_with("ok -")
        || lower.contains("no problems found")
        || lower.contains("everything is correct")
    {
        return Some(true);
    }
    let has_problem_list = trimmed.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with('-') || l.starts_with('*') || l.starts_with("1.")
    }) || lower.contains("problem");
    if has_problem_list {
        return Some(false);
    }
    None
}

fn mentions_execution(description: &str) -> bool {
    let lower = description.to_lowercase();
    ["run", "execute", "deploy", "install", "migrate", "build", "restart", "apply"]
        .iter()
        .any(|v| lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *v))
}

fn mentions_artifact(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("write") && (lower.contains("file") || lower.contains("document"))
        || lower.contains("save")
        || lower.contains(".md")
        || lower.contains(".csv")
        || lower.contains(".json")
}

fn mentions_image_artifact(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("screenshot")
        || (lower.contains("capture") && lower.contains("image"))
        || lower.contains(".png")
}

fn is_image_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"].iter().any(|ext| lower.ends_with(ext))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // Loop-level behavior is exercised end-to-end in crate::tests; these
    // cover the pure helpers.

    #[test]
    fn blocking_question_shapes() {
        assert!(is_blocking_question("Which workspace should I target: A or B?"));
        assert!(is_blocking_question("Do you want me to proceed with the deletion?"));
        assert!(!is_blocking_question("The answer is 42."));
        assert!(!is_blocking_question("I wonder what this does?\nProceeding with the fix."));
    }

    #[test]
    fn sanitize_strips_inline_tool_markup() {
        let dirty = "before <tool_call>{\"name\":\"x\"}</tool_call> after";
        assert_eq!(sanitize_assistant_text(dirty), "before  after");
        assert_eq!(sanitize_assistant_text("clean text"), "clean text");
    }

    #[test]
    fn verification_signal_parses_ok_and_problems() {
        assert_eq!(verification_signal("OK"), Some(true));
        assert_eq!(verification_signal("ok. all checks passed"), Some(true));
        assert_eq!(verification_signal("Problems found:\n- output file is empty"), Some(false));
        assert_eq!(verification_signal("- the test still fails"), Some(false));
        assert_eq!(verification_signal("working on it"), None);
        assert_eq!(verification_signal(""), None);
    }

    #[test]
    fn execution_and_artifact_cues() {
        assert!(mentions_execution("Run the database migration"));
        assert!(!mentions_execution("Summarize the running costs"));
        assert!(mentions_artifact("Write the report file"));
        assert!(mentions_artifact("save results to output.csv"));
        assert!(!mentions_artifact("Review the findings"));
    }

    #[test]
    fn image_artifact_cues_and_paths() {
        assert!(mentions_image_artifact("Take a screenshot of the dashboard"));
        assert!(!mentions_image_artifact("Describe the dashboard layout"));
        assert!(is_image_path("/w/shot.PNG"));
        assert!(!is_image_path("/w/notes.md"));
    }

    #[test]
    fn context_overflow_detection() {
        assert!(is_context_overflow(&anyhow::anyhow!("maximum context length is 8192 tokens")));
        assert!(is_context_overflow(&anyhow::anyhow!("request exceeds context window")));
        assert!(!is_context_overflow(&anyhow::anyhow!("rate limit exceeded")));
    }

    #[test]
    fn step_clock_soft_fires_before_hard() {
        let clock = StepClock::new(Duration::from_secs(100));
        assert!(clock.soft < clock.hard);
        assert!(clock.hard_remaining().is_some());
    }
}
