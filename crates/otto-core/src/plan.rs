// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Hard ceiling on total steps a plan may ever hold, revisions included.
pub const MAX_TOTAL_STEPS: usize = 20;
/// How many times a plan may be revised over the life of a task.
pub const MAX_PLAN_REVISIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Primary,
    Verification,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        let description = description.into();
        let kind = infer_step_kind(&description);
        Self {
            id: Uuid::new_v4().to_string(),
            description,
            kind,
            status: StepStatus::Pending,
            error: None,
        }
    }

    pub fn recovery(description: impl Into<String>) -> Self {
        Self { kind: StepKind::Recovery, ..Self::new(description) }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, StepStatus::Pending | StepStatus::InProgress)
    }
}

/// Infer a step's kind from its description.
///
/// Verification cues only count when the step does not also mutate —
/// "verify and fix the tests" is primary work, not a verification gate.
fn infer_step_kind(description: &str) -> StepKind {
    let lower = description.to_lowercase();
    let verification_cue = lower.starts_with("verify")
        || lower.starts_with("double-check")
        || lower.contains("verification")
        || lower.starts_with("confirm that")
        || lower.starts_with("check that");
    let mutation_verb = ["fix", "implement", "write", "create", "update", "delete", "install", "apply"]
        .iter()
        .any(|v| lower.contains(v));
    if verification_cue && !mutation_verb {
        StepKind::Verification
    } else {
        StepKind::Primary
    }
}

/// The ordered plan for a task.
///
/// Invariants enforced here:
/// - at most one step is in progress,
/// - revisions never rewrite the completed prefix,
/// - total step count stays within [`MAX_TOTAL_STEPS`],
/// - at most [`MAX_PLAN_REVISIONS`] revisions per task,
/// - a revision may not reintroduce a step lexically similar to one that
///   already failed, unless it is tagged as a recovery revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub description: String,
    pub steps: Vec<PlanStep>,
    pub revision_count: u32,
}

/// Why a revision was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionRejection {
    RevisionLimit,
    StepLimit,
    SimilarToFailed { failed_description: String },
}

impl std::fmt::Display for RevisionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevisionRejection::RevisionLimit => {
                write!(f, "plan revision limit ({MAX_PLAN_REVISIONS}) reached")
            }
            RevisionRejection::StepLimit => {
                write!(f, "plan step limit ({MAX_TOTAL_STEPS}) reached")
            }
            RevisionRejection::SimilarToFailed { failed_description } => {
                write!(f, "new step repeats an already-failed step: {failed_description:?}")
            }
        }
    }
}

impl Plan {
    pub fn new(description: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self { description: description.into(), steps, revision_count: 0 }
    }

    /// One-step fallback plan built straight from the task prompt.
    pub fn fallback(prompt: &str) -> Self {
        Self::new("Single-step plan", vec![PlanStep::new(prompt)])
    }

    /// Parse a plan from the model's JSON reply, falling back to a one-step
    /// plan when the reply is not the expected `{description, steps[]}`
    /// object.  Step count is clamped to [`MAX_TOTAL_STEPS`].
    pub fn from_llm_json(reply: &str, fallback_prompt: &str) -> Self {
        let Some(parsed) = extract_plan_object(reply) else {
            warn!("plan reply was not parseable JSON; using one-step fallback");
            return Self::fallback(fallback_prompt);
        };
        let description = parsed["description"].as_str().unwrap_or("Plan").to_string();
        let steps: Vec<PlanStep> = parsed["steps"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| {
                        s.as_str()
                            .map(str::to_string)
                            .or_else(|| s["description"].as_str().map(str::to_string))
                    })
                    .filter(|d| !d.trim().is_empty())
                    .take(MAX_TOTAL_STEPS)
                    .map(PlanStep::new)
                    .collect()
            })
            .unwrap_or_default();
        if steps.is_empty() {
            warn!("plan reply contained no usable steps; using one-step fallback");
            return Self::fallback(fallback_prompt);
        }
        Self::new(description, steps)
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::InProgress)
    }

    pub fn next_pending(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Mark the step in progress, demoting any other in-progress step back
    /// to pending so the single-in-progress invariant holds.
    pub fn start_step(&mut self, id: &str) {
        for s in &mut self.steps {
            if s.status == StepStatus::InProgress && s.id != id {
                s.status = StepStatus::Pending;
            }
        }
        if let Some(s) = self.step_mut(id) {
            s.status = StepStatus::InProgress;
        }
    }

    pub fn complete_step(&mut self, id: &str) {
        if let Some(s) = self.step_mut(id) {
            s.status = StepStatus::Completed;
            s.error = None;
        }
    }

    pub fn fail_step(&mut self, id: &str, error: impl Into<String>) {
        if let Some(s) = self.step_mut(id) {
            s.status = StepStatus::Failed;
            s.error = Some(error.into());
        }
    }

    pub fn skip_step(&mut self, id: &str) {
        if let Some(s) = self.step_mut(id) {
            s.status = StepStatus::Skipped;
        }
    }

    /// Reset a failed or in-progress step to pending (user retry feedback).
    pub fn reset_step(&mut self, id: &str) {
        if let Some(s) = self.step_mut(id) {
            s.status = StepStatus::Pending;
            s.error = None;
        }
    }

    pub fn failed_steps(&self) -> Vec<&PlanStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed).collect()
    }

    pub fn completed_steps(&self) -> Vec<&PlanStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| !s.is_open())
    }

    /// Revise the plan by inserting `new_descriptions` immediately after the
    /// in-progress step (or at the end when none is active).
    ///
    /// `clear_remaining` drops the not-yet-started steps after the insertion
    /// point; the completed prefix is always preserved untouched.  A reason
    /// string starting with `recovery` marks a recovery revision, which is
    /// exempt from the similar-to-failed guard.
    pub fn revise(
        &mut self,
        new_descriptions: Vec<String>,
        reason: &str,
        clear_remaining: bool,
    ) -> Result<Vec<String>, RevisionRejection> {
        if self.revision_count >= MAX_PLAN_REVISIONS {
            return Err(RevisionRejection::RevisionLimit);
        }
        let is_recovery = reason.to_lowercase().starts_with("recovery");
        if !is_recovery {
            for desc in &new_descriptions {
                if let Some(failed) = self
                    .failed_steps()
                    .iter()
                    .find(|s| lexically_similar(&s.description, desc))
                {
                    return Err(RevisionRejection::SimilarToFailed {
                        failed_description: failed.description.clone(),
                    });
                }
            }
        }

        let insert_at = self
            .steps
            .iter()
            .position(|s| s.status == StepStatus::InProgress)
            .map(|i| i + 1)
            .unwrap_or(self.steps.len());

        let kept_tail: Vec<PlanStep> = if clear_remaining {
            Vec::new()
        } else {
            self.steps[insert_at..].to_vec()
        };
        let kept = insert_at + kept_tail.len();
        if kept + new_descriptions.len() > MAX_TOTAL_STEPS {
            return Err(RevisionRejection::StepLimit);
        }

        let new_steps: Vec<PlanStep> = new_descriptions
            .into_iter()
            .map(|d| if is_recovery { PlanStep::recovery(d) } else { PlanStep::new(d) })
            .collect();
        let new_ids: Vec<String> = new_steps.iter().map(|s| s.id.clone()).collect();

        self.steps.truncate(insert_at);
        self.steps.extend(new_steps);
        self.steps.extend(kept_tail);
        self.revision_count += 1;
        Ok(new_ids)
    }

    /// Insert recovery steps after the failed step without counting against
    /// the revision budget (the auto-recovery budget is enforced upstream).
    /// Still bounded by the total-step ceiling.
    pub fn inject_recovery(
        &mut self,
        after_step_id: &str,
        descriptions: Vec<String>,
    ) -> Result<Vec<String>, RevisionRejection> {
        if self.steps.len() + descriptions.len() > MAX_TOTAL_STEPS {
            return Err(RevisionRejection::StepLimit);
        }
        let insert_at = self
            .steps
            .iter()
            .position(|s| s.id == after_step_id)
            .map(|i| i + 1)
            .unwrap_or(self.steps.len());
        let new_steps: Vec<PlanStep> = descriptions.into_iter().map(PlanStep::recovery).collect();
        let ids: Vec<String> = new_steps.iter().map(|s| s.id.clone()).collect();
        self.steps.splice(insert_at..insert_at, new_steps);
        Ok(ids)
    }

    /// Short textual summary for snapshots and step context.
    pub fn summary(&self) -> String {
        let done = self.completed_steps().len();
        let total = self.steps.len();
        let mut out = format!("{} ({done}/{total} steps done)", self.description);
        for s in &self.steps {
            let marker = match s.status {
                StepStatus::Completed => "x",
                StepStatus::InProgress => ">",
                StepStatus::Failed => "!",
                StepStatus::Skipped => "-",
                StepStatus::Pending => " ",
            };
            out.push_str(&format!("\n[{marker}] {}", s.description));
        }
        out
    }
}

/// Whether two step descriptions are close enough to count as retrying the
/// same thing.  Token-set overlap; order-insensitive on purpose ("fix the
/// build" vs "the build fix").
fn lexically_similar(a: &str, b: &str) -> bool {
    let tok = |s: &str| -> std::collections::HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect()
    };
    let ta = tok(a);
    let tb = tok(b);
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    (inter as f64) / (union as f64) >= 0.75
}

fn extract_plan_object(reply: &str) -> Option<serde_json::Value> {
    // The model may wrap the JSON in prose or a code fence; parse the first
    // top-level object found.
    let start = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in reply[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&reply[start..start + i + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
