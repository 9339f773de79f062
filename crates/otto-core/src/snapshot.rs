// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetUsage;
use crate::conversation::{ConversationLog, Entry};
use crate::fileops::FileOperationTracker;

/// Everything needed to resume a task after a restart: the sanitized
/// history, file-operation tracker, plan summary, and cumulative usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub task_id: String,
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
    pub fileops: FileOperationTracker,
    pub plan_summary: String,
    pub usage: BudgetUsage,
}

impl ConversationSnapshot {
    /// Rebuild the conversation, refusing snapshots whose history violates
    /// the pairing invariant (a corrupt snapshot must not poison the next
    /// provider call).
    pub fn restore_conversation(&self) -> anyhow::Result<ConversationLog> {
        let log = ConversationLog::from_entries(self.entries.clone());
        log.validate_pairing().map_err(|e| anyhow::anyhow!("snapshot history invalid: {e}"))?;
        Ok(log)
    }
}

/// Snapshot persistence capability.  Only the most recent snapshot per task
/// is meaningful; `prune_old` drops the rest.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn write(&self, snapshot: ConversationSnapshot) -> anyhow::Result<()>;
    async fn prune_old(&self, task_id: &str) -> anyhow::Result<()>;
    async fn latest(&self, task_id: &str) -> anyhow::Result<Option<ConversationSnapshot>>;
}

/// In-memory store used by tests and by hosts that persist elsewhere.
#[derive(Default)]
pub struct InMemorySnapshots {
    by_task: Mutex<HashMap<String, Vec<ConversationSnapshot>>>,
}

impl InMemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, task_id: &str) -> usize {
        self.by_task.lock().unwrap().get(task_id).map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshots {
    async fn write(&self, snapshot: ConversationSnapshot) -> anyhow::Result<()> {
        self.by_task
            .lock()
            .unwrap()
            .entry(snapshot.task_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn prune_old(&self, task_id: &str) -> anyhow::Result<()> {
        if let Some(v) = self.by_task.lock().unwrap().get_mut(task_id) {
            if v.len() > 1 {
                let last = v.pop().unwrap();
                v.clear();
                v.push(last);
            }
        }
        Ok(())
    }

    async fn latest(&self, task_id: &str) -> anyhow::Result<Option<ConversationSnapshot>> {
        Ok(self.by_task.lock().unwrap().get(task_id).and_then(|v| v.last().cloned()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
