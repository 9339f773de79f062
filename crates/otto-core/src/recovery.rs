// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Truncated responses that may be continued before giving up.
pub const MAX_MAX_TOKENS_RECOVERIES: u32 = 3;

/// What kind of failure a step died of.  Drives the shape of the recovery
/// steps — or whether recovery is attempted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryClass {
    /// Only the user can resolve this (credentials, approvals, decisions).
    UserBlocker,
    /// The provider ran dry (quota, rate limits, billing).
    ProviderQuota,
    /// Something in the local environment broke (missing binary, bad path,
    /// compile error) — diagnosable and retryable with corrected inputs.
    LocalRuntime,
    /// An external system misbehaved in a way we cannot name.
    ExternalUnknown,
}

/// Classify a step failure from its error text.
pub fn classify_failure(error_text: &str) -> RecoveryClass {
    let lower = error_text.to_lowercase();
    if ["credential", "login", "password", "2fa", "approval required", "needs your", "awaiting user", "unauthorized"]
        .iter()
        .any(|m| lower.contains(m))
    {
        return RecoveryClass::UserBlocker;
    }
    if ["quota", "rate limit", "insufficient credit", "billing", "429", "overloaded"]
        .iter()
        .any(|m| lower.contains(m))
    {
        return RecoveryClass::ProviderQuota;
    }
    if [
        "command not found",
        "no such file",
        "permission denied",
        "compile error",
        "compilation failed",
        "syntax error",
        "not installed",
        "invalid argument",
    ]
    .iter()
    .any(|m| lower.contains(m))
    {
        return RecoveryClass::LocalRuntime;
    }
    RecoveryClass::ExternalUnknown
}

/// Canonical recovery steps for a classified failure.
///
/// Empty means "escalate to the user" — there is nothing the executor can
/// do on its own.  Deep-work tasks get research-flavoured recovery
/// (web_search plus a scratchpad write) where normal tasks prefer a minimal
/// alternate toolchain.
pub fn recovery_steps_for(
    class: RecoveryClass,
    failed_description: &str,
    deep_work: bool,
) -> Vec<String> {
    match class {
        RecoveryClass::UserBlocker => Vec::new(),
        RecoveryClass::ProviderQuota => vec![format!(
            "Retry the blocked work using an alternate provider or a lighter-weight path: \
             {failed_description}"
        )],
        RecoveryClass::LocalRuntime => vec![
            format!(
                "Diagnose the runtime error from the last attempt (read the exact error \
                 output) before retrying: {failed_description}"
            ),
            format!("Retry with corrected inputs: {failed_description}"),
        ],
        RecoveryClass::ExternalUnknown => {
            if deep_work {
                vec![
                    format!(
                        "Research the failure with web_search and record findings in the \
                         scratchpad, then retry: {failed_description}"
                    ),
                    format!("Apply the researched workaround: {failed_description}"),
                ]
            } else {
                vec![format!(
                    "Attempt the same outcome through an alternate toolchain or a minimal \
                     in-repo change: {failed_description}"
                )]
            }
        }
    }
}

/// Dedup key so the same recovery plan is not injected twice for the same
/// kind of failure on the same step.
pub fn recovery_signature(class: RecoveryClass, failed_description: &str) -> String {
    format!("{class:?}:{}", failed_description.to_lowercase())
}

/// Tracks which recovery plans have already been injected this task.
#[derive(Debug, Default)]
pub struct RecoveryLedger {
    seen: HashSet<String>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a signature is seen.
    pub fn admit(&mut self, signature: &str) -> bool {
        self.seen.insert(signature.to_string())
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
