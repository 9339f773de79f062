// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use otto_config::AgentConfig;
use otto_model::Usage;
use serde::{Deserialize, Serialize};

use crate::error::FailureClass;

/// Where a task came from.  Cron-originating tasks qualify for the
/// partial-success policy on budget exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    User,
    Cron,
    SubAgent,
    Api,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Quality grade of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Ok,
    PartialSuccess,
}

/// The task record the executor drives.
///
/// Identity fields are immutable after creation; status and usage are
/// mutated only by the lifecycle supervisor.  Creation and destruction
/// belong to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub prompt: String,
    /// Opaque workspace reference owned by the host.
    pub workspace: Option<String>,
    pub parent_id: Option<String>,
    /// Sub-agent nesting depth (0 = user-facing root task).
    pub depth: u32,
    pub source: TaskSource,
    pub created_at: DateTime<Utc>,

    pub status: TaskStatus,
    /// Full-task retry attempts (trackers reset between attempts).
    pub attempt: u32,
    pub agent_config: AgentConfig,
    /// Host-provided success criteria shown to the model and the oracle.
    pub success_criteria: Option<String>,
    pub terminal_status: Option<TerminalStatus>,
    pub failure_class: Option<FailureClass>,
    /// Cumulative usage across all attempts and continuations.
    pub usage: Usage,
    pub result_summary: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            prompt: prompt.into(),
            workspace: None,
            parent_id: None,
            depth: 0,
            source: TaskSource::default(),
            created_at: Utc::now(),
            status: TaskStatus::Planning,
            attempt: 0,
            agent_config: AgentConfig::default(),
            success_criteria: None,
            terminal_status: None,
            failure_class: None,
            usage: Usage::default(),
            result_summary: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// The final outcome handed back to the host when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub terminal_status: Option<TerminalStatus>,
    pub failure_class: Option<FailureClass>,
    pub result_summary: Option<String>,
    /// Step ids whose failures were tolerated ("completed with warnings").
    pub warnings: Vec<String>,
    pub usage: Usage,
}

impl TaskOutcome {
    pub fn completed(terminal: TerminalStatus, summary: Option<String>, usage: Usage) -> Self {
        Self {
            status: TaskStatus::Completed,
            terminal_status: Some(terminal),
            failure_class: None,
            result_summary: summary,
            warnings: Vec::new(),
            usage,
        }
    }

    pub fn failed(class: FailureClass, summary: Option<String>, usage: Usage) -> Self {
        Self {
            status: TaskStatus::Failed,
            terminal_status: None,
            failure_class: Some(class),
            result_summary: summary,
            warnings: Vec::new(),
            usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_planning() {
        let t = Task::new("t1", "Title", "do things");
        assert_eq!(t.status, TaskStatus::Planning);
        assert_eq!(t.attempt, 0);
        assert!(!t.is_terminal());
    }

    #[test]
    fn terminal_statuses_are_detected() {
        let mut t = Task::new("t1", "Title", "p");
        t.status = TaskStatus::Completed;
        assert!(t.is_terminal());
        t.status = TaskStatus::Paused;
        assert!(!t.is_terminal());
        t.status = TaskStatus::Cancelled;
        assert!(t.is_terminal());
    }

    #[test]
    fn builder_sets_source_and_config() {
        let cfg = AgentConfig { max_turns: 7, ..AgentConfig::default() };
        let t = Task::new("t", "t", "p").with_config(cfg).with_source(TaskSource::Cron);
        assert_eq!(t.source, TaskSource::Cron);
        assert_eq!(t.agent_config.max_turns, 7);
    }

    #[test]
    fn outcome_constructors_set_status() {
        let ok = TaskOutcome::completed(TerminalStatus::Ok, Some("done".into()), Usage::default());
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.terminal_status, Some(TerminalStatus::Ok));

        let failed = TaskOutcome::failed(FailureClass::ToolError, None, Usage::default());
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.failure_class, Some(FailureClass::ToolError));
    }

    #[test]
    fn task_round_trips_through_json() {
        let t = Task::new("t1", "Title", "prompt").with_source(TaskSource::Cron);
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "t1");
        assert_eq!(back.source, TaskSource::Cron);
        assert_eq!(back.status, TaskStatus::Planning);
    }
}
