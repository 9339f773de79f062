// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::CancelReason;

/// User feedback on the active step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFeedbackAction {
    Retry,
    Skip,
    Stop,
    Drift,
}

#[derive(Debug, Clone)]
pub struct StepFeedback {
    pub step_id: String,
    pub action: StepFeedbackAction,
    pub message: Option<String>,
}

/// A queued follow-up user message.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub text: String,
}

/// Cross-thread control state shared between the lifecycle entry points and
/// the running turn loop.
///
/// `Cancel`, `Pause`, and `WrapUp` deliberately do NOT take the lifecycle
/// mutex: they flip atomics here and cancel the current abort token, and
/// the loop observes the flags at its suspension points.  A fresh token is
/// installed immediately after every forced abort so later work is not
/// born cancelled.
#[derive(Debug)]
pub struct ControlSignals {
    cancel: Mutex<Option<CancelReason>>,
    wrap_up: AtomicBool,
    paused: AtomicBool,
    resume_notify: Notify,
    abort: Mutex<CancellationToken>,
    follow_ups: Mutex<VecDeque<FollowUp>>,
    feedback: Mutex<VecDeque<StepFeedback>>,
}

impl Default for ControlSignals {
    fn default() -> Self {
        Self {
            cancel: Mutex::new(None),
            wrap_up: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            abort: Mutex::new(CancellationToken::new()),
            follow_ups: Mutex::new(VecDeque::new()),
            feedback: Mutex::new(VecDeque::new()),
        }
    }
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Mark the task cancelled and abort the in-flight deadline.  The first
    /// reason wins; later calls are no-ops.
    pub fn request_cancel(&self, reason: CancelReason) {
        let mut slot = self.cancel.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.abort_and_refresh();
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel.lock().unwrap()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    // ── Wrap-up ───────────────────────────────────────────────────────────────

    /// Mark the soft deadline reached and abort the in-flight call.
    /// Idempotent: returns true only on the first call.
    pub fn request_wrap_up(&self) -> bool {
        let first = !self.wrap_up.swap(true, Ordering::SeqCst);
        if first {
            self.abort_and_refresh();
        }
        first
    }

    pub fn wrap_up_requested(&self) -> bool {
        self.wrap_up.load(Ordering::SeqCst)
    }

    // ── Pause / resume ────────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cooperative pause point: parks until `resume` (or cancellation).
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            let notified = self.resume_notify.notified();
            if !self.is_paused() {
                break;
            }
            notified.await;
        }
    }

    // ── Abort token ───────────────────────────────────────────────────────────

    /// The token guarding the current LLM/tool call.
    pub fn current_token(&self) -> CancellationToken {
        self.abort.lock().unwrap().clone()
    }

    /// Cancel the current token and install a fresh one.
    pub fn abort_and_refresh(&self) {
        let mut slot = self.abort.lock().unwrap();
        slot.cancel();
        *slot = CancellationToken::new();
    }

    // ── Queues ────────────────────────────────────────────────────────────────

    pub fn queue_follow_up(&self, text: impl Into<String>) {
        self.follow_ups.lock().unwrap().push_back(FollowUp { text: text.into() });
    }

    pub fn drain_follow_ups(&self) -> Vec<FollowUp> {
        self.follow_ups.lock().unwrap().drain(..).collect()
    }

    pub fn push_feedback(&self, feedback: StepFeedback) {
        self.feedback.lock().unwrap().push_back(feedback);
    }

    pub fn drain_feedback(&self) -> Vec<StepFeedback> {
        self.feedback.lock().unwrap().drain(..).collect()
    }

    /// Clear transient state for a brand-new run attempt (cancel flags are
    /// final and deliberately NOT cleared here).
    pub fn reset_for_continuation(&self) {
        self.wrap_up.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
