// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use otto_config::{AgentConfig, EnvFlags};
use otto_model::{collect_response, CompletionRequest, LlmProvider, Message};
use otto_tools::{OutputCategory, ToolCall, ToolKind, ToolOutput, ToolRegistry};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::BudgetGovernor;
use crate::compact::smart_truncate;
use crate::dedup::{DedupVerdict, ToolCallDeduplicator};
use crate::events::{EventSink, TaskEvent};
use crate::failures::{is_hard_failure, CircuitBreaker, CrossStepFailures, VariedFailures};
use crate::fileops::FileOperationTracker;
use crate::services::CitationTracker;

/// Heartbeat cadence for long-running tools.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(12);
/// Margin kept between a tool deadline and the step deadline.
const STEP_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
const BROWSER_TIMEOUT_FLOOR: Duration = Duration::from_secs(90);
const VISION_TIMEOUT: Duration = Duration::from_secs(150);
const COMMAND_TIMEOUT_CAP: Duration = Duration::from_secs(300);

/// Why the gatekeeper rejected a call without executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BudgetExhausted,
    ModeGate,
    DomainGate,
    CrossStepBlocked,
    CircuitOpen,
    Unavailable,
    SchemaInvalid,
    DuplicateExact,
    DuplicateSimilar,
    Cancelled,
    RedundantRead,
    RedundantListing,
    HtmlGuard,
}

impl RejectReason {
    /// Reasons that count as "the model is blocked, not wrong" when the
    /// turn-level failure decision runs.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, RejectReason::RedundantListing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::BudgetExhausted => "budget_exhausted",
            RejectReason::ModeGate => "mode_gate",
            RejectReason::DomainGate => "domain_gate",
            RejectReason::CrossStepBlocked => "cross_step_blocked",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::Unavailable => "unavailable",
            RejectReason::SchemaInvalid => "schema_invalid",
            RejectReason::DuplicateExact => "duplicate",
            RejectReason::DuplicateSimilar => "duplicate_similar",
            RejectReason::Cancelled => "cancelled",
            RejectReason::RedundantRead => "redundant_read",
            RejectReason::RedundantListing => "redundant_listing",
            RejectReason::HtmlGuard => "html_guard",
        }
    }
}

/// What happened to one tool call.
#[derive(Debug)]
pub enum GateOutcome {
    /// The call ran; `hard_failure` marks unavailability/timeouts/fatal
    /// errors as opposed to input-dependent ones.
    Executed { output: ToolOutput, hard_failure: bool },
    /// The call was answered synthetically without running the tool.
    Rejected { output: ToolOutput, reason: RejectReason },
}

impl GateOutcome {
    pub fn output(&self) -> &ToolOutput {
        match self {
            GateOutcome::Executed { output, .. } | GateOutcome::Rejected { output, .. } => output,
        }
    }

    /// Whether this outcome blocks progress (for the turn-level failure
    /// decision): rejections, hard failures, but not ordinary tool errors.
    pub fn is_blocking(&self) -> bool {
        match self {
            GateOutcome::Executed { hard_failure, .. } => *hard_failure,
            GateOutcome::Rejected { reason, .. } => reason.is_blocking(),
        }
    }
}

/// Read-only context handed to the gatekeeper per call.
pub struct GateContext<'a> {
    pub config: &'a AgentConfig,
    pub flags: &'a EnvFlags,
    pub registry: &'a ToolRegistry,
    pub events: Arc<dyn EventSink>,
    pub citations: &'a dyn CitationTracker,
    pub token: CancellationToken,
    /// Time left on the step deadline, if one is running.
    pub step_remaining: Option<Duration>,
    /// Most recent assistant text (canvas fallback extraction).
    pub recent_assistant_text: Option<String>,
    /// Provider for the canvas-content generation fallback.
    pub provider: Option<Arc<dyn LlmProvider>>,
}

/// The gatekeeper mediates every tool call: an ordered pipeline of
/// validation, policy, dedup, and redundancy checks, then execution under a
/// per-tool deadline with heartbeats.  Every rejection produces a synthetic
/// `tool_result` so the pairing invariant holds no matter what.
#[derive(Default)]
pub struct ToolGatekeeper {
    dedup: ToolCallDeduplicator,
    cross_step: CrossStepFailures,
    breaker: CircuitBreaker,
    varied: VariedFailures,
    fileops: FileOperationTracker,
}

impl ToolGatekeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cross_step(&self) -> &CrossStepFailures {
        &self.cross_step
    }

    pub fn varied(&self) -> &VariedFailures {
        &self.varied
    }

    pub fn fileops(&self) -> &FileOperationTracker {
        &self.fileops
    }

    pub fn fileops_mut(&mut self) -> &mut FileOperationTracker {
        &mut self.fileops
    }

    /// Full task retry: every tracker starts over.
    pub fn reset(&mut self) {
        self.dedup.reset();
        self.cross_step.reset();
        self.varied.reset();
        self.fileops.reset();
        self.breaker = CircuitBreaker::new();
    }

    /// Restore file-operation state from a snapshot.
    pub fn restore_fileops(&mut self, fileops: FileOperationTracker) {
        self.fileops = fileops;
    }

    /// Run the pipeline for one assistant tool_use and execute it if every
    /// check admits it.
    pub async fn process_call(
        &mut self,
        call_id: &str,
        raw_name: &str,
        mut input: Value,
        budget: &mut BudgetGovernor,
        ctx: &GateContext<'_>,
    ) -> GateOutcome {
        // 1. Budget exhaustion: remaining turn budget and tool budgets.
        let name = normalize_tool_name(raw_name);
        let is_web_search = name == "web_search";
        if budget.remaining_turns() == 0 {
            return reject(
                call_id,
                "Turn budget reached its soft landing: do not start new tool work. \
                 Produce your final answer as text now.",
                RejectReason::BudgetExhausted,
            );
        }
        if budget.check_before_tool_call(is_web_search).is_err()
            || (is_web_search && budget.search_streak_exhausted())
        {
            return reject(
                call_id,
                "The tool budget for this task is exhausted. Produce the deliverable \
                 from what you already know instead of calling more tools.",
                RejectReason::BudgetExhausted,
            );
        }

        // 2. (normalization happened above) — look the tool up for the
        // policy checks; unknown tools fall through to the availability
        // check so the model gets the right message.
        let tool = ctx.registry.get(&name);

        // 3. Execution-mode / domain policy.
        if let Some(t) = &tool {
            if t.is_mutating() && !ctx.config.execution_mode.allows_mutation() {
                ctx.events.emit(TaskEvent::ModeGateBlocked {
                    tool: name.clone(),
                    mode: format!("{:?}", ctx.config.execution_mode).to_lowercase(),
                });
                return reject(
                    call_id,
                    format!(
                        "Tool {name} mutates state and is not permitted in \
                         {:?} mode. Describe the proposed change as text instead.",
                        ctx.config.execution_mode
                    ),
                    RejectReason::ModeGate,
                );
            }
            if t.is_technical() && !ctx.config.task_domain.allows_technical_tools() {
                ctx.events.emit(TaskEvent::ModeGateBlocked {
                    tool: name.clone(),
                    mode: format!("{:?}", ctx.config.task_domain).to_lowercase(),
                });
                return reject(
                    call_id,
                    format!("Tool {name} is not available for this task domain."),
                    RejectReason::DomainGate,
                );
            }
        }

        // 4. Cross-step failure threshold.
        if self.cross_step.is_blocked(&name) {
            return reject(
                call_id,
                format!(
                    "Tool {name} has failed repeatedly across this task and is now \
                     blocked. Output the deliverable directly as text instead of \
                     retrying the tool."
                ),
                RejectReason::CrossStepBlocked,
            );
        }

        // 5. Per-process circuit breaker.
        if self.breaker.is_open(&name) {
            let last = self.breaker.last_error(&name).unwrap_or("tool disabled").to_string();
            return reject(call_id, last, RejectReason::CircuitOpen);
        }

        // 6. Availability.
        let Some(tool) = tool.filter(|_| ctx.config.tool_allowed(&name)) else {
            return reject(
                call_id,
                format!("Tool {name} is not available in this task."),
                RejectReason::Unavailable,
            );
        };

        // 7. Parameter inference.
        for (from, to) in infer_parameters(&mut input, &tool.input_schema()) {
            ctx.events.emit(TaskEvent::ParameterInference {
                tool: name.clone(),
                from_field: from,
                to_field: to,
            });
        }

        // 8. Canvas-push fallback: fill missing content from recent output.
        if tool.kind() == ToolKind::Canvas && !has_content_field(&input) {
            let html = self.canvas_fallback_content(ctx).await;
            if let Some(obj) = input.as_object_mut() {
                obj.insert("content".into(), Value::String(html));
            }
        }

        // 9. Shallow schema validation.
        if let Err(missing) = validate_input(&input, &tool.input_schema()) {
            return reject(
                call_id,
                format!("Invalid input for {name}: missing required field(s) {missing:?}."),
                RejectReason::SchemaInvalid,
            );
        }

        // 10. Deduplication (idempotent tools are exempt).
        if !tool.is_idempotent() {
            match self.dedup.check(&name, &input) {
                DedupVerdict::Allow => {}
                verdict => {
                    budget.record_duplicate_blocked();
                    let reason = if verdict == DedupVerdict::DuplicateExact {
                        RejectReason::DuplicateExact
                    } else {
                        RejectReason::DuplicateSimilar
                    };
                    return reject(
                        call_id,
                        "Duplicate tool call: an identical or near-identical call just \
                         ran. Use its result instead of repeating the call.",
                        reason,
                    );
                }
            }
        }

        // 11. Cancellation check.
        if ctx.token.is_cancelled() {
            return reject(call_id, "Task was cancelled before the tool ran.", RejectReason::Cancelled);
        }

        // 12. File-operation redundancy.
        if name == "read_file" {
            if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                if self.fileops.is_redundant_read(path) {
                    return reject(
                        call_id,
                        format!(
                            "{path} was already read this task and has not changed since. \
                             Use the earlier content."
                        ),
                        RejectReason::RedundantRead,
                    );
                }
            }
        }
        if name == "list_directory" {
            if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                if let Some(cached) = self.fileops.cached_listing(path) {
                    return GateOutcome::Rejected {
                        output: ToolOutput::ok(call_id, format!("[cached listing]\n{cached}")),
                        reason: RejectReason::RedundantListing,
                    };
                }
            }
        }
        if tool.is_mutating() {
            if let (Some(path), Some(content)) = (
                input.get("path").and_then(|v| v.as_str()),
                input.get("content").and_then(|v| v.as_str()),
            ) {
                if self.fileops.refuses_html_write(path, content, Utc::now()) {
                    return reject(
                        call_id,
                        "Refusing to write a near-empty HTML file right after a failed \
                         web fetch. Fetch real content or report the fetch failure.",
                        RejectReason::HtmlGuard,
                    );
                }
            }
        }

        // ── Execution ─────────────────────────────────────────────────────────
        budget.record_tool_call(is_web_search);
        self.dedup.record(&name, &input);
        ctx.events.emit(TaskEvent::ToolCall { tool: name.clone(), call_id: call_id.to_string() });

        let timeout = tool_timeout(tool.kind(), &input, ctx.step_remaining);
        let call = ToolCall { id: call_id.to_string(), name: name.clone(), input: input.clone() };

        // Heartbeat for long-running or mutating tools; aborted before the
        // result is appended so it cannot race the final message.
        let heartbeat = if timeout >= Duration::from_secs(60) || tool.is_mutating() {
            Some(spawn_heartbeat(name.clone(), Arc::clone(&ctx.events)))
        } else {
            None
        };

        let result = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => None,
            result = tokio::time::timeout(timeout, ctx.registry.execute(&call)) => Some(result),
        };
        if let Some(hb) = heartbeat {
            hb.abort();
        }

        let output = match result {
            None => {
                return reject(call_id, "Task was cancelled while the tool ran.", RejectReason::Cancelled)
            }
            Some(Err(_elapsed)) => {
                debug!(tool = %name, ?timeout, "tool call timed out");
                ToolOutput::err(
                    call_id,
                    format!("Tool {name} timed out after {} s.", timeout.as_secs()),
                )
            }
            Some(Ok(output)) => output,
        };

        // ── Post-execution accounting ─────────────────────────────────────────
        let hard_failure = output.is_error && is_hard_failure(&output.content);
        if output.is_error {
            self.cross_step.record_failure(&name);
            self.varied.record_failure(&name);
            if hard_failure {
                self.breaker.record_hard_failure(&name, output.content.clone());
            }
            if name == "web_fetch" {
                self.fileops.record_web_fetch_failure(Utc::now());
            }
        } else {
            self.cross_step.record_success(&name);
            self.breaker.record_success(&name);
            match name.as_str() {
                "read_file" => {
                    if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                        self.fileops.record_read(path);
                    }
                }
                "list_directory" => {
                    if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                        self.fileops.record_listing(path, &output.content);
                    }
                }
                "web_fetch" => {
                    if let Some(url) = input.get("url").and_then(|v| v.as_str()) {
                        ctx.citations.record_source(url, extract_publish_date(&output.content));
                    }
                }
                _ => {}
            }
            if tool.is_mutating() {
                if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                    self.fileops.record_mutation(path);
                }
            }
        }
        // Sanitize the result for the conversation.
        let content = smart_truncate(
            &output.content,
            tool.output_category(),
            ctx.flags.tool_response_max_tokens,
        );
        let output = ToolOutput { call_id: output.call_id, content, is_error: output.is_error };

        ctx.events.emit(TaskEvent::ToolResult {
            tool: name.clone(),
            call_id: call_id.to_string(),
            is_error: output.is_error,
        });
        if output.is_error {
            ctx.events.emit(TaskEvent::ToolError {
                tool: name,
                call_id: call_id.to_string(),
                message: output.content.clone(),
            });
        }

        GateOutcome::Executed { output, hard_failure }
    }

    /// Canvas fallback chain: lift a complete HTML document out of the most
    /// recent assistant text, else generate one with a short tool-free model
    /// call, else a static placeholder.
    async fn canvas_fallback_content(&self, ctx: &GateContext<'_>) -> String {
        if let Some(text) = &ctx.recent_assistant_text {
            if let Some(html) = extract_html_document(text) {
                return html;
            }
        }
        if let Some(provider) = &ctx.provider {
            let request = CompletionRequest {
                system: None,
                messages: vec![Message::user(
                    "Produce a minimal, complete HTML document presenting the current \
                     task progress. Reply with HTML only.",
                )],
                tools: Vec::new(),
                max_tokens: Some(1024),
                stream: false,
            };
            if let Ok(stream) = provider.complete(request).await {
                if let Ok(response) = collect_response(stream, |_| {}).await {
                    if let Some(html) = extract_html_document(&response.text()) {
                        return html;
                    }
                }
            }
            warn!("canvas content generation produced no HTML; using placeholder");
        }
        "<!DOCTYPE html><html><body><p>Content pending.</p></body></html>".to_string()
    }
}

fn reject(call_id: &str, msg: impl Into<String>, reason: RejectReason) -> GateOutcome {
    GateOutcome::Rejected { output: ToolOutput::err(call_id, msg), reason }
}

/// Strip dotted namespace prefixes some models prepend to tool names.
pub fn normalize_tool_name(raw: &str) -> String {
    let mut name = raw.trim();
    for prefix in ["functions.", "tool.", "tools."] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            name = stripped;
        }
    }
    name.to_string()
}

/// Rewrite well-known parameter aliases into the canonical field the schema
/// expects.  Returns the (from, to) pairs that were applied.
fn infer_parameters(input: &mut Value, schema: &Value) -> Vec<(String, String)> {
    const ALIASES: [(&str, &str); 7] = [
        ("filename", "path"),
        ("file_path", "path"),
        ("filepath", "path"),
        ("file", "path"),
        ("text", "content"),
        ("body", "content"),
        ("contents", "content"),
    ];
    let mut applied = Vec::new();
    let Some(obj) = input.as_object_mut() else {
        return applied;
    };
    let schema_props: Vec<String> = schema["properties"]
        .as_object()
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();
    for (from, to) in ALIASES {
        if obj.contains_key(from)
            && !obj.contains_key(to)
            && schema_props.iter().any(|p| p == to)
            && !schema_props.iter().any(|p| p == from)
        {
            let v = obj.remove(from).unwrap();
            obj.insert(to.to_string(), v);
            applied.push((from.to_string(), to.to_string()));
        }
    }
    applied
}

fn has_content_field(input: &Value) -> bool {
    input
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Shallow schema validation: the input must be an object carrying every
/// required field.
fn validate_input(input: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let Some(obj) = input.as_object() else {
        return Err(vec!["<input must be an object>".to_string()]);
    };
    let missing: Vec<String> = schema["required"]
        .as_array()
        .map(|req| {
            req.iter()
                .filter_map(|r| r.as_str())
                .filter(|r| !obj.contains_key(*r))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

/// Per-tool deadline, bounded above by the step deadline minus a margin.
fn tool_timeout(kind: ToolKind, input: &Value, step_remaining: Option<Duration>) -> Duration {
    let base = match kind {
        ToolKind::Browser => BROWSER_TIMEOUT_FLOOR,
        ToolKind::Vision => VISION_TIMEOUT,
        ToolKind::Command => input
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT)
            .min(COMMAND_TIMEOUT_CAP),
        ToolKind::ChildAgent => {
            // Child agents run their own loop: scale with the requested
            // runtime and leave headroom for wrap-up.
            let requested = input
                .get("timeout_ms")
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(300));
            requested.mul_f64(1.2)
        }
        ToolKind::Search | ToolKind::Generic | ToolKind::Canvas => DEFAULT_TOOL_TIMEOUT,
    };
    let capped = match step_remaining {
        Some(remaining) if remaining > STEP_DEADLINE_MARGIN => {
            base.min(remaining - STEP_DEADLINE_MARGIN)
        }
        Some(_) => Duration::from_secs(1),
        None => base,
    };
    // Browser startup cannot meaningfully run under its floor unless the
    // step itself is about to die.
    if kind == ToolKind::Browser && step_remaining.map(|r| r > BROWSER_TIMEOUT_FLOOR).unwrap_or(true)
    {
        capped.max(BROWSER_TIMEOUT_FLOOR)
    } else {
        capped
    }
}

fn spawn_heartbeat(tool: String, events: Arc<dyn EventSink>) -> tokio::task::JoinHandle<()> {
    let started = std::time::Instant::now();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            events.emit(TaskEvent::ProgressUpdate {
                tool: tool.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
    })
}

/// Find a complete HTML document inside free text.
fn extract_html_document(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let start = lower.find("<!doctype html").or_else(|| lower.find("<html"))?;
    let end = lower.rfind("</html>")? + "</html>".len();
    if end <= start {
        return None;
    }
    Some(text[start..end].to_string())
}

/// Pull an ISO-ish publish date out of fetched page text.
fn extract_publish_date(content: &str) -> Option<chrono::DateTime<Utc>> {
    let re = regex::Regex::new(r"\b(20\d{2})-(\d{2})-(\d{2})\b").ok()?;
    let caps = re.captures(content)?;
    let date = format!("{}-{}-{}T00:00:00Z", &caps[1], &caps[2], &caps[3]);
    chrono::DateTime::parse_from_rfc3339(&date).ok().map(|d| d.with_timezone(&Utc))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
