// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort external capabilities.
//!
//! The executor calls these opportunistically and swallows failures: a
//! broken memory service must never fail a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Long-term memory: recall relevant context at step start, store the
/// pre-compaction summary so knowledge survives the drop.
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn recall(&self, query: &str) -> Option<String>;
    async fn store_summary(&self, task_id: &str, summary: &str);
}

/// Playbooks: prior successful approaches for similar prompts.
#[async_trait]
pub trait PlaybookService: Send + Sync {
    async fn playbook_for(&self, prompt: &str) -> Option<String>;
}

/// Knowledge-graph sink for facts discovered during the run.
#[async_trait]
pub trait KnowledgeGraphService: Send + Sync {
    async fn record_fact(&self, task_id: &str, fact: &str);
}

/// Source tracking for research outputs.  Sync because the gatekeeper
/// records sources inline while processing tool results.
pub trait CitationTracker: Send + Sync {
    fn record_source(&self, url: &str, published: Option<DateTime<Utc>>);
    fn source_count(&self) -> usize;
    /// Sources with a parseable publish date (the completion oracle's
    /// high-risk-claim check needs at least one).
    fn dated_source_count(&self) -> usize;
}

/// No-op implementation of every service; the default wiring for tests and
/// hosts that do not provide these capabilities.
#[derive(Debug, Default, Clone)]
pub struct NullServices;

#[async_trait]
impl MemoryService for NullServices {
    async fn recall(&self, _query: &str) -> Option<String> {
        None
    }
    async fn store_summary(&self, _task_id: &str, _summary: &str) {}
}

#[async_trait]
impl PlaybookService for NullServices {
    async fn playbook_for(&self, _prompt: &str) -> Option<String> {
        None
    }
}

#[async_trait]
impl KnowledgeGraphService for NullServices {
    async fn record_fact(&self, _task_id: &str, _fact: &str) {}
}

impl CitationTracker for NullServices {
    fn record_source(&self, _url: &str, _published: Option<DateTime<Utc>>) {}
    fn source_count(&self) -> usize {
        0
    }
    fn dated_source_count(&self) -> usize {
        0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
