// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end executor scenarios.
//!
//! Every test drives a full [`TaskExecutor`] against [`ScriptedMockProvider`]
//! and in-memory capability fakes, so runs are deterministic and need no
//! network.  Nudge assertions check structure (events, counts), never the
//! wording of model-facing messages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};

use otto_config::AgentConfig;
use otto_model::{
    CompletionRequest, LlmProvider, ResponseEvent, ResponseStream, ScriptedMockProvider,
};
use otto_tools::{Tool, ToolCall, ToolKind, ToolOutput, ToolRegistry};

use crate::{
    CancelReason, CollectingSink, ExecutorDeps, InMemorySnapshots, Task, TaskExecutor, TaskSource,
    TaskStatus, TerminalStatus,
};
use crate::snapshot::SnapshotStore;

// ── Test tooling ──────────────────────────────────────────────────────────────

struct TestTool {
    name: &'static str,
    kind: ToolKind,
    mutating: bool,
    output: String,
    fail_with: Option<String>,
    calls: Arc<AtomicU32>,
}

impl TestTool {
    fn new(name: &'static str, output: impl Into<String>) -> Self {
        Self {
            name,
            kind: ToolKind::Generic,
            mutating: false,
            output: output.into(),
            fail_with: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for TestTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {
            "path": {"type": "string"}, "query": {"type": "string"},
            "pattern": {"type": "string"}, "url": {"type": "string"},
            "command": {"type": "string"}, "content": {"type": "string"}
        }})
    }
    fn kind(&self) -> ToolKind {
        self.kind
    }
    fn is_mutating(&self) -> bool {
        self.mutating
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(msg) => ToolOutput::err(&call.id, msg.clone()),
            None => ToolOutput::ok(&call.id, self.output.clone()),
        }
    }
}

/// Provider that serves queued scripts, then hangs forever (the stream
/// never yields) so cancellation paths can be exercised on real time.
struct HangingProvider {
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
}

impl HangingProvider {
    fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self { scripts: Mutex::new(scripts) }
    }
}

#[async_trait]
impl LlmProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }
    fn model_name(&self) -> &str {
        "hanging-model"
    }
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            Ok(Box::pin(stream::pending()))
        } else {
            let script = scripts.remove(0);
            Ok(Box::pin(stream::iter(script.into_iter().map(Ok))))
        }
    }
}

struct Harness {
    executor: Arc<TaskExecutor>,
    events: Arc<CollectingSink>,
    snapshots: Arc<InMemorySnapshots>,
}

fn harness_with_provider(
    task: Task,
    provider: Arc<dyn LlmProvider>,
    tools: Vec<TestTool>,
) -> Harness {
    let mut registry = ToolRegistry::new();
    for t in tools {
        registry.register(t);
    }
    let events = Arc::new(CollectingSink::new());
    let snapshots = Arc::new(InMemorySnapshots::new());
    let mut deps = ExecutorDeps::new(provider, Arc::new(registry));
    deps.events = events.clone();
    deps.snapshots = snapshots.clone();
    let executor = Arc::new(TaskExecutor::new(task, deps));
    Harness { executor, events, snapshots }
}

fn harness(task: Task, scripts: Vec<Vec<ResponseEvent>>, tools: Vec<TestTool>) -> Harness {
    harness_with_provider(task, Arc::new(ScriptedMockProvider::new(scripts)), tools)
}

fn plan_script(steps: &[&str]) -> Vec<ResponseEvent> {
    let steps_json: Vec<String> = steps.iter().map(|s| format!("{s:?}")).collect();
    ScriptedMockProvider::text_script(format!(
        r#"{{"description": "test plan", "steps": [{}]}}"#,
        steps_json.join(",")
    ))
}

/// Assert that `needles` appear in `haystack` in order (gaps allowed).
fn assert_subsequence(haystack: &[&str], needles: &[&str]) {
    let mut it = haystack.iter();
    for needle in needles {
        assert!(
            it.any(|k| k == needle),
            "event {needle:?} missing or out of order in {haystack:?}"
        );
    }
}

// ── Scenario 1: happy path, one step, one tool ───────────────────────────────

#[tokio::test]
async fn happy_path_one_step_one_tool() {
    let task = Task::new("t1", "Summarize readme", "Read /w/readme and summarize it.");
    let h = harness(
        task,
        vec![
            plan_script(&["Read /w/readme and summarize it"]),
            ScriptedMockProvider::tool_use_script("tu1", "read_file", r#"{"path": "/w/readme"}"#),
            ScriptedMockProvider::text_script(
                "The readme introduces the project and how to read and build it.",
            ),
        ],
        vec![TestTool::new("read_file", "hello from the readme")],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.terminal_status, Some(TerminalStatus::Ok));

    let kinds = h.events.kinds();
    assert_subsequence(
        &kinds,
        &[
            "plan_created",
            "step_started",
            "tool_call",
            "tool_result",
            "assistant_message",
            "step_completed",
            "task_completed",
        ],
    );
    assert_eq!(h.executor.budget_usage().await.tool_calls, 1);
}

#[tokio::test]
async fn happy_path_snapshot_restores_valid_history() {
    let task = Task::new("t1", "Summarize readme", "Read /w/readme and summarize it.");
    let h = harness(
        task,
        vec![
            plan_script(&["Read /w/readme and summarize it"]),
            ScriptedMockProvider::tool_use_script("tu1", "read_file", r#"{"path": "/w/readme"}"#),
            ScriptedMockProvider::text_script("The readme is a short read about the project."),
        ],
        vec![TestTool::new("read_file", "hello")],
    );
    h.executor.execute().await;

    // Round-trip: only the latest snapshot is retained, and its history
    // passes pairing validation on restore.
    let latest = h.snapshots.latest("t1").await.unwrap().expect("snapshot written");
    assert!(latest.restore_conversation().is_ok());
    assert_eq!(h.snapshots.count("t1"), 1, "older snapshots pruned");
}

// ── Scenario 2: turn-limit budget continuation ───────────────────────────────

#[tokio::test]
async fn turn_limit_then_continuation() {
    let config = AgentConfig { max_turns: 3, ..AgentConfig::default() };
    let task = Task::new("t2", "Explore", "Explore the workspace thoroughly.").with_config(config);
    let h = harness(
        task,
        vec![
            plan_script(&["Explore the workspace"]),
            ScriptedMockProvider::tool_use_script("a", "grep", r#"{"pattern": "alpha"}"#),
            ScriptedMockProvider::tool_use_script("b", "grep", r#"{"pattern": "beta"}"#),
            // Served after the continuation resets the budget:
            ScriptedMockProvider::text_script(
                "The workspace exploration is complete; contents are catalogued.",
            ),
        ],
        vec![TestTool::new("grep", "match found")],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Failed);

    let turn_limit_error = h.events.events().iter().any(|e| {
        matches!(e, crate::TaskEvent::Error { code, action_hint, .. }
            if code == "TURN_LIMIT_EXCEEDED" && action_hint.as_deref() == Some("continue_task"))
    });
    assert!(turn_limit_error, "turn-limit error with continue hint expected: {:?}", h.events.kinds());

    let outcome = h.executor.continue_after_budget_exhausted().await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(h.events.count_of("budget_reset_for_continuation"), 1);
    // The continuation segment starts its counters fresh.
    assert!(h.executor.budget_usage().await.global_turns <= 2);
}

// ── Scenario 3: duplicate tool call ──────────────────────────────────────────

#[tokio::test]
async fn duplicate_web_search_is_blocked_synthetically() {
    let task = Task::new("t3", "Search", "Find recent articles about rust executors.");
    let double_search = vec![
        ResponseEvent::ToolUse {
            index: 0,
            id: "s1".into(),
            name: "web_search".into(),
            arguments: r#"{"query": "x"}"#.into(),
        },
        ResponseEvent::ToolUse {
            index: 1,
            id: "s2".into(),
            name: "web_search".into(),
            arguments: r#"{"query": "x"}"#.into(),
        },
        ResponseEvent::Stop(otto_model::StopReason::ToolUse),
        ResponseEvent::Done,
    ];
    let search_tool = TestTool::new("web_search", "three results");
    let executions = search_tool.counter();
    let h = harness(
        task,
        vec![
            plan_script(&["Search for articles"]),
            double_search,
            ScriptedMockProvider::text_script(
                "Recent articles about rust executors are summarized above.",
            ),
        ],
        vec![search_tool],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1, "second identical call must not execute");

    let usage = h.executor.budget_usage().await;
    assert_eq!(usage.web_search_calls, 1);
    assert_eq!(usage.duplicates_blocked, 1);
    assert_eq!(h.events.count_of("tool_blocked"), 1);

    // Pairing invariant: both tool_use ids got exactly one result.
    let latest = h.snapshots.latest("t3").await.unwrap().unwrap();
    assert!(latest.restore_conversation().is_ok());
}

// ── Scenario 4: proactive compaction ─────────────────────────────────────────

#[tokio::test]
async fn proactive_compaction_summarizes_dropped_history() {
    let task = Task::new("t4", "Digest", "Digest the dataset and report the findings.");
    let provider = ScriptedMockProvider::new(vec![
        plan_script(&["Load the dataset", "Report the findings"]),
        ScriptedMockProvider::tool_use_script("d1", "read_file", r#"{"path": "/data/big"}"#),
        ScriptedMockProvider::text_script("The dataset is loaded and parsed."),
        // Consumed by the compaction summarizer at the start of step 2:
        ScriptedMockProvider::text_script("## Primary Request\nDigest the dataset"),
        ScriptedMockProvider::text_script(
            "The findings report: the dataset digest is complete with stable results.",
        ),
    ])
    .with_context_window(2_000);
    let h = harness_with_provider(
        task,
        Arc::new(provider),
        vec![TestTool::new("read_file", "x".repeat(6_000))],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed);

    let summarized = h.events.events().iter().any(|e| {
        matches!(e, crate::TaskEvent::ContextSummarized { proactive: true, tokens_before, tokens_after }
            if tokens_after < tokens_before)
    });
    assert!(summarized, "proactive context_summarized expected: {:?}", h.events.kinds());

    let latest = h.snapshots.latest("t4").await.unwrap().unwrap();
    assert!(latest.restore_conversation().is_ok(), "no tool pair may straddle the drop");
}

// ── Scenario 5: wrap-up during a hung call ───────────────────────────────────

#[tokio::test]
async fn wrap_up_aborts_in_flight_call_and_completes() {
    let task = Task::new("t5", "Long haul", "Work through the backlog carefully.");
    let provider = Arc::new(HangingProvider::new(vec![plan_script(&["Work the backlog"])]));
    let h = harness_with_provider(task, provider, vec![]);

    let executor = h.executor.clone();
    let run = tokio::spawn(async move { executor.execute().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.executor.wrap_up();
    h.executor.wrap_up(); // idempotent

    let outcome = run.await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed, "wrap-up always completes");
    assert!(outcome.terminal_status.is_some());
    assert_eq!(h.events.count_of("task_completed"), 1);
}

// ── Scenario: user cancellation never finalizes ──────────────────────────────

#[tokio::test]
async fn user_cancel_unwinds_without_finalization() {
    let task = Task::new("t6", "Long haul", "Work through the backlog carefully.");
    let provider = Arc::new(HangingProvider::new(vec![plan_script(&["Work the backlog"])]));
    let h = harness_with_provider(task, provider, vec![]);

    let executor = h.executor.clone();
    let run = tokio::spawn(async move { executor.execute().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.executor.cancel(CancelReason::User);

    let outcome = run.await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);
    assert_eq!(h.events.count_of("task_completed"), 0, "no finalization under user cancel");
    assert_eq!(h.events.count_of("task_cancelled"), 1);
}

// ── Scenario 6: required-decision pause and resume ───────────────────────────

#[tokio::test]
async fn required_decision_pauses_then_send_message_finishes() {
    let task = Task::new("t7", "Summarize", "Summarize the workspace readme for the team.");
    let h = harness(
        task,
        vec![
            plan_script(&["Summarize the readme"]),
            ScriptedMockProvider::tool_use_script("r1", "read_file", r#"{"path": "/w/readme"}"#),
            ScriptedMockProvider::text_script("Which workspace should I target: A or B?"),
            // Follow-up turn after SendMessage("B"):
            ScriptedMockProvider::text_script("Understood, targeting workspace B."),
            // Step re-dispatch completes the plan:
            ScriptedMockProvider::text_script(
                "The workspace B readme summary for the team is ready above.",
            ),
        ],
        vec![TestTool::new("read_file", "readme body")],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Paused);
    let awaiting = h.events.events().iter().any(|e| {
        matches!(e, crate::TaskEvent::AwaitingUserInput { reason_code, .. }
            if reason_code == "required_decision")
    });
    assert!(awaiting, "awaiting_user_input with required_decision expected");

    let outcome = h.executor.send_message("B").await;
    assert_eq!(outcome.status, TaskStatus::Completed, "events: {:?}", h.events.kinds());
}

// ── Loop detection: three identical calls, one nudge ─────────────────────────

#[tokio::test]
async fn repeated_identical_calls_trigger_one_loop_nudge_then_recovery() {
    let task = Task::new("t8", "Hunt", "Hunt down the flaky configuration value.");
    let same_grep =
        || ScriptedMockProvider::tool_use_script("g", "grep", r#"{"pattern": "flaky", "path": "/w/conf"}"#);
    let h = harness(
        task,
        vec![
            plan_script(&["Find the flaky configuration value"]),
            same_grep(),
            same_grep(),
            same_grep(),
            // Recovery step after the step fails:
            ScriptedMockProvider::text_script(
                "The flaky configuration value hunt concluded; details noted above.",
            ),
        ],
        vec![TestTool::new("grep", "one match")],
    );

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed, "events: {:?}", h.events.kinds());
    assert_eq!(h.events.count_of("tool_loop_detected"), 1, "loop-break nudge is one-shot");
    assert_eq!(h.events.count_of("tool_recovery_prompted"), 1, "recovery hint is one-shot");
    assert_subsequence(&h.events.kinds(), &["step_failed", "step_recovery_planned", "task_completed"]);
    assert!(!outcome.warnings.is_empty(), "failed step is tolerated as a warning");
    assert_eq!(outcome.terminal_status, Some(TerminalStatus::PartialSuccess));
}

// ── Max-tokens truncation: bounded recoveries then structured failure ────────

#[tokio::test]
async fn repeated_truncation_recovers_then_fails_the_step() {
    let task = Task::new("t9", "Write-up", "Write up the incident timeline.");
    let h = harness(
        task,
        vec![
            plan_script(&["Draft the incident timeline"]),
            ScriptedMockProvider::max_tokens_script("The timeline begins"),
            ScriptedMockProvider::max_tokens_script("and continues"),
            ScriptedMockProvider::max_tokens_script("and continues further"),
            ScriptedMockProvider::max_tokens_script("and still continues"),
            // Recovery step:
            ScriptedMockProvider::text_script(
                "The incident timeline write-up is complete in condensed form.",
            ),
        ],
        vec![],
    );

    let outcome = h.executor.execute().await;
    assert!(h.events.count_of("max_tokens_recovery") >= 3, "three recoveries must be attempted");
    let failed_truncation = h.events.events().iter().any(|e| {
        matches!(e, crate::TaskEvent::StepFailed { error, .. } if error.contains("truncated"))
    });
    assert!(failed_truncation, "structured failure after recoveries: {:?}", h.events.kinds());
    assert_eq!(outcome.status, TaskStatus::Completed, "recovery step salvages the task");
}

// ── Cron partial success on budget exhaustion ────────────────────────────────

#[tokio::test]
async fn cron_task_with_coverage_ends_partial_success_on_budget_exhaustion() {
    let config = AgentConfig { max_turns: 2, ..AgentConfig::default() };
    let task = Task::new("t10", "Nightly digest", "Produce the nightly digest.")
        .with_config(config)
        .with_source(TaskSource::Cron);
    let h = harness(
        task,
        vec![
            plan_script(&["Assemble the digest"]),
            ScriptedMockProvider::text_script(
                "Nightly digest: twelve services reported healthy, two deploys landed \
                 cleanly, error budgets are intact, and no pages fired overnight. \
                 Latency held steady across every region, queue depth stayed nominal, \
                 and the full service-by-service notes follow in the sections above.",
            ),
            ScriptedMockProvider::tool_use_script("x1", "grep", r#"{"pattern": "extra"}"#),
        ],
        vec![TestTool::new("grep", "match")],
    );

    // Turn 1: plan. Turn 2: digest text completes step one and the plan —
    // finalization happens before the budget can run out, so force a second
    // pass through a follow-up that burns the remaining turn.
    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed);

    let outcome = h.executor.send_message("Also check the archives.").await;
    // The follow-up hits the turn limit; cron + adequate coverage lands as
    // partial success instead of failure.
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.terminal_status, Some(TerminalStatus::PartialSuccess));
}

// ── Follow-up on a completed task restores status when chat-only ─────────────

#[tokio::test]
async fn answer_only_follow_up_restores_completed_status() {
    let task = Task::new("t11", "Summarize", "Summarize the readme briefly.");
    let h = harness(
        task,
        vec![
            plan_script(&["Summarize the readme"]),
            ScriptedMockProvider::text_script("The readme summary is brief and complete."),
            ScriptedMockProvider::text_script("It was about two hundred words long."),
        ],
        vec![],
    );
    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed);

    let outcome = h.executor.send_message("How long was it?").await;
    assert_eq!(outcome.status, TaskStatus::Completed, "chat-only follow-up keeps completed status");
    assert_eq!(outcome.result_summary.as_deref(), Some("It was about two hundred words long."));
}

// ── Step feedback: skip ──────────────────────────────────────────────────────

#[tokio::test]
async fn skip_feedback_marks_step_completed_without_work() {
    let task = Task::new("t12", "Two phases", "Do the optional audit then summarize findings.");
    // The plan is installed directly below, so no planning call happens;
    // the only script serves step 2 (step 1 is skipped before its first
    // model call).
    let h = harness(
        task,
        vec![ScriptedMockProvider::text_script(
            "Findings summarized: the optional audit was skipped by request.",
        )],
        vec![],
    );

    // Install the plan up front so the first step's id is known, and queue
    // the skip before execution — the step drains it at its first iteration
    // boundary, before any model call.
    let plan = crate::Plan::new(
        "two phases",
        vec![
            crate::PlanStep::new("Run the optional audit"),
            crate::PlanStep::new("Summarize the findings"),
        ],
    );
    let skip_id = plan.steps[0].id.clone();
    h.executor.set_plan(plan).await;
    h.executor.set_step_feedback(&skip_id, crate::StepFeedbackAction::Skip, None);

    let outcome = h.executor.execute().await;
    assert_eq!(outcome.status, TaskStatus::Completed, "events: {:?}", h.events.kinds());
    assert_eq!(h.events.count_of("step_skipped"), 1);
    assert_eq!(h.events.count_of("step_feedback"), 1);
}
