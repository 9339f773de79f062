// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_model::{sanitize, ContentBlock, Message, MessageContent, Role, TokenEstimator};
use serde::{Deserialize, Serialize};

use crate::compact::emergency_drop_range;

/// Utilization fraction at which proactive compaction fires.
pub const COMPACTION_TRIGGER: f64 = 0.80;
/// Utilization fraction compaction aims for after dropping messages.
pub const COMPACTION_TARGET: f64 = 0.60;

/// Placeholder written over stale duplicate/blocked tool errors.
const PRUNED_ERROR_PLACEHOLDER: &str = "[stale tool error pruned]";

/// Anchor tags for pinned context blocks, in their required insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinnedTag {
    UserProfile,
    SharedContext,
    CompactionSummary,
    MemoryRecall,
}

/// One entry in the conversation: a message, optionally anchored to a pinned
/// tag.  Pinned entries are updated in place rather than appended, survive
/// compaction, and are excluded from consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub message: Message,
    pub pinned: Option<PinnedTag>,
}

/// Outcome of a compaction pass.
#[derive(Debug)]
pub struct CompactionOutcome {
    /// Messages removed from the history, oldest first.
    pub removed: Vec<Message>,
    pub proactive: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// The conversation store: owns the message history and every invariant the
/// provider wire format imposes on it.
///
/// Invariants maintained across all mutations:
/// 1. every assistant `tool_use` is answered by a `tool_result` in the next
///    user message — no orphans, no duplicates;
/// 2. consecutive same-role messages are merged only when both are plain
///    text;
/// 3. pinned blocks never split a tool-use/tool-result pair;
/// 4. image payloads expire into placeholders outside the freshness window.
#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<Entry>,
    estimator: TokenEstimator,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from snapshot entries.  The caller is expected to have
    /// validated the snapshot (see [`ConversationLog::validate_pairing`]).
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries, estimator: TokenEstimator::new() }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The provider-ready message list.
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn estimator_mut(&mut self) -> &mut TokenEstimator {
        &mut self.estimator
    }

    /// Append a message after runtime sanitization (stale-image expiry over
    /// the whole history).
    pub fn push(&mut self, message: Message) {
        self.entries.push(Entry { message, pinned: None });
        let mut msgs: Vec<Message> = self.entries.iter().map(|e| e.message.clone()).collect();
        if sanitize::expire_stale_images(&mut msgs) > 0 {
            for (entry, msg) in self.entries.iter_mut().zip(msgs) {
                entry.message = msg;
            }
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Message::assistant(text));
    }

    /// The most recent substantive assistant text, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|e| {
            if e.message.role != Role::Assistant {
                return None;
            }
            let text = e.message.text_content();
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        })
    }

    /// Estimated tokens for the current history plus a system prompt.
    pub fn token_estimate(&self, system_tokens: usize) -> usize {
        let msgs: Vec<Message> = self.entries.iter().map(|e| e.message.clone()).collect();
        self.estimator.conversation(&msgs, system_tokens)
    }

    // ── Pinned blocks ─────────────────────────────────────────────────────────

    /// Insert or update a pinned text block.
    ///
    /// Idempotent by tag: repeated upserts with the same tag rewrite the one
    /// existing entry.  New entries are placed after every pinned tag that
    /// orders before them, then pushed forward past any position that would
    /// split a tool-use/tool-result pair.
    pub fn upsert_pinned(&mut self, tag: PinnedTag, content: impl Into<String>) {
        let content = content.into();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pinned == Some(tag)) {
            entry.message = Message::user(content);
            return;
        }
        let mut idx = self
            .entries
            .iter()
            .rposition(|e| e.pinned.map(|t| t <= tag).unwrap_or(false))
            .map(|i| i + 1)
            .unwrap_or(0);
        while self.would_split_pair(idx) {
            idx += 1;
        }
        self.entries.insert(idx, Entry { message: Message::user(content), pinned: Some(tag) });
    }

    pub fn pinned_content(&self, tag: PinnedTag) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.pinned == Some(tag))
            .map(|e| e.message.text_content())
    }

    /// Whether inserting at `idx` would land between an assistant message
    /// with tool_use blocks and the user message answering them.
    fn would_split_pair(&self, idx: usize) -> bool {
        if idx == 0 || idx >= self.entries.len() {
            return false;
        }
        let prev = &self.entries[idx - 1].message;
        let next = &self.entries[idx].message;
        prev.role == Role::Assistant && prev.has_tool_use() && next.has_tool_result()
    }

    // ── Consolidation and pruning ─────────────────────────────────────────────

    /// Merge adjacent text-only user messages (providers enforcing strict
    /// role alternation reject u/u sequences).  Pinned entries and anything
    /// carrying tool results are never merged.  Idempotent.
    pub fn consolidate_consecutive_user(&mut self) {
        let mut i = 0;
        while i + 1 < self.entries.len() {
            let mergeable = {
                let a = &self.entries[i];
                let b = &self.entries[i + 1];
                a.pinned.is_none()
                    && b.pinned.is_none()
                    && a.message.role == Role::User
                    && b.message.role == Role::User
                    && a.message.is_text_only()
                    && b.message.is_text_only()
            };
            if mergeable {
                let tail = self.entries.remove(i + 1);
                let merged = format!(
                    "{}\n\n{}",
                    self.entries[i].message.text_content(),
                    tail.message.text_content()
                );
                self.entries[i].message = Message::user(merged);
            } else {
                i += 1;
            }
        }
    }

    /// Rewrite older duplicate/blocked tool-error payloads to a minimal
    /// placeholder.  Pairing is preserved (the block stays, only its content
    /// shrinks) and the most recent message is never touched.  Idempotent:
    /// the placeholder matches neither marker.
    pub fn prune_stale_tool_errors(&mut self) {
        let len = self.entries.len();
        if len < 2 {
            return;
        }
        for entry in &mut self.entries[..len - 1] {
            let MessageContent::Blocks(blocks) = &mut entry.message.content else {
                continue;
            };
            for block in blocks.iter_mut() {
                if let ContentBlock::ToolResult { content, is_error: true, .. } = block {
                    let lower = content.to_lowercase();
                    if lower.contains("duplicate") || lower.contains("blocked") {
                        *content = PRUNED_ERROR_PLACEHOLDER.to_string();
                    }
                }
            }
        }
    }

    // ── Pairing invariant ─────────────────────────────────────────────────────

    /// Check invariant 1 over the whole history.  Returns a description of
    /// the first violation, if any.
    pub fn validate_pairing(&self) -> Result<(), String> {
        let msgs: Vec<&Message> = self.entries.iter().map(|e| &e.message).collect();
        let mut open: Vec<String> = Vec::new();
        for (i, msg) in msgs.iter().enumerate() {
            match msg.role {
                Role::Assistant => {
                    if !open.is_empty() {
                        return Err(format!(
                            "assistant message at {i} while tool_use ids {open:?} are unanswered"
                        ));
                    }
                    open = msg.tool_use_ids().iter().map(|s| s.to_string()).collect();
                }
                Role::User => {
                    for id in msg.tool_result_ids() {
                        match open.iter().position(|o| o == id) {
                            Some(pos) => {
                                open.remove(pos);
                            }
                            None => {
                                return Err(format!(
                                    "orphan tool_result {id:?} at message {i}"
                                ));
                            }
                        }
                    }
                }
            }
        }
        if open.is_empty() {
            Ok(())
        } else {
            Err(format!("tool_use ids {open:?} never received a tool_result"))
        }
    }

    /// Synthesize error tool_results for any tool_use left hanging at the
    /// end of the history (an aborted turn), so the pairing invariant cannot
    /// break.  Returns the ids that were repaired.
    pub fn close_hanging_tool_uses(&mut self, note: &str) -> Vec<String> {
        let Some(last) = self.entries.last() else {
            return Vec::new();
        };
        if last.message.role != Role::Assistant || !last.message.has_tool_use() {
            return Vec::new();
        }
        let ids: Vec<String> =
            last.message.tool_use_ids().iter().map(|s| s.to_string()).collect();
        let results: Vec<ContentBlock> = ids
            .iter()
            .map(|id| ContentBlock::tool_result(id.clone(), note, true))
            .collect();
        self.entries.push(Entry { message: Message::tool_results(results), pinned: None });
        ids
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// Run compaction if needed.
    ///
    /// Proactive: fires when utilization crosses [`COMPACTION_TRIGGER`] and
    /// drops down toward [`COMPACTION_TARGET`].  Reactive (`force = true`):
    /// fires unconditionally — the last resort before a call that would
    /// overflow the window.  Pinned entries and the most recent message
    /// always survive; the drop range never splits a tool pair.
    ///
    /// Returns `None` when nothing needed to happen.
    pub fn compact_with_meta(
        &mut self,
        system_tokens: usize,
        context_window: usize,
        force: bool,
    ) -> Option<CompactionOutcome> {
        if context_window == 0 {
            return None;
        }
        let tokens_before = self.token_estimate(system_tokens);
        let utilization = tokens_before as f64 / context_window as f64;
        let proactive = !force;
        if !force && utilization < COMPACTION_TRIGGER {
            return None;
        }
        let target_tokens = (context_window as f64 * COMPACTION_TARGET) as usize;

        // Split pinned and droppable entries; only droppables are candidates.
        let droppable_idx: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pinned.is_none())
            .map(|(i, _)| i)
            .collect();
        if droppable_idx.len() <= 1 {
            return None;
        }

        // Walk forward over droppables, accumulating until the remainder
        // would fit the target.  The most recent message is excluded.
        let droppable_msgs: Vec<Message> = droppable_idx
            .iter()
            .map(|&i| self.entries[i].message.clone())
            .collect();
        let mut drop_count = 0usize;
        let mut tokens = tokens_before;
        for msg in droppable_msgs.iter().take(droppable_msgs.len() - 1) {
            if tokens <= target_tokens {
                break;
            }
            tokens = tokens.saturating_sub(self.estimator.message(msg));
            drop_count += 1;
        }
        if drop_count == 0 {
            return None;
        }
        // Align the boundary to a clean turn edge within the droppable view.
        let keep = droppable_msgs.len() - drop_count;
        drop_count = emergency_drop_range(&droppable_msgs, keep);
        if drop_count == 0 {
            return None;
        }

        let removed_indices: Vec<usize> = droppable_idx[..drop_count].to_vec();
        let mut removed = Vec::with_capacity(drop_count);
        for &i in removed_indices.iter().rev() {
            removed.push(self.entries.remove(i).message);
        }
        removed.reverse();

        let tokens_after = self.token_estimate(system_tokens);
        debug_assert!(self.validate_pairing().is_ok(), "compaction broke tool pairing");
        Some(CompactionOutcome { removed, proactive, tokens_before, tokens_after })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
