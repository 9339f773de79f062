// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Process-level feature flags and tuning knobs read from the environment.
///
/// These are deployment-wide (not per-task): the daemon sets them once and
/// every executor in the process sees the same values.  Tests construct the
/// struct directly instead of going through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvFlags {
    /// Master switch for per-profile budget contracts.  When false the
    /// profile caps (turns/tools/searches/recovery) are bypassed; token and
    /// cost budgets stay active.
    pub budget_contracts_enabled: bool,
    /// Finalize cron-originating tasks as partial_success instead of failed
    /// when budgets run out but the candidate answer has adequate coverage.
    pub partial_success_for_cron: bool,
    /// Completion-guard phases.  Phase A gates direct-answer checks; phase B
    /// additionally gates evidence checks.
    pub guardrail_phase_a: bool,
    pub guardrail_phase_b: bool,
    /// Output tokens/second assumed before any observation exists.
    pub output_tps_fallback: f64,
    /// Multiplier applied to the observed TPS when deriving deadlines.
    pub tps_safety_factor: f64,
    /// Per-retry-attempt decay applied to max_tokens.
    pub retry_token_decay: f64,
    /// Per-retry-attempt decay applied to the call deadline.
    pub retry_timeout_decay: f64,
    /// Cap on tokens a single tool result may occupy in the conversation.
    pub tool_response_max_tokens: usize,
}

impl Default for EnvFlags {
    fn default() -> Self {
        Self {
            budget_contracts_enabled: true,
            partial_success_for_cron: true,
            guardrail_phase_a: true,
            guardrail_phase_b: true,
            output_tps_fallback: 40.0,
            tps_safety_factor: 0.7,
            retry_token_decay: 0.65,
            retry_timeout_decay: 0.75,
            tool_response_max_tokens: 4_000,
        }
    }
}

impl EnvFlags {
    /// Read flags from the process environment, falling back to defaults for
    /// unset or unparseable variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            budget_contracts_enabled: env_bool("OTTO_BUDGET_CONTRACTS", d.budget_contracts_enabled),
            partial_success_for_cron: env_bool("OTTO_PARTIAL_SUCCESS_FOR_CRON", d.partial_success_for_cron),
            guardrail_phase_a: env_bool("OTTO_GUARDRAIL_PHASE_A", d.guardrail_phase_a),
            guardrail_phase_b: env_bool("OTTO_GUARDRAIL_PHASE_B", d.guardrail_phase_b),
            output_tps_fallback: env_f64("OTTO_OUTPUT_TPS_FALLBACK", d.output_tps_fallback),
            tps_safety_factor: env_f64("OTTO_TPS_SAFETY_FACTOR", d.tps_safety_factor),
            retry_token_decay: env_f64("OTTO_RETRY_TOKEN_DECAY", d.retry_token_decay),
            retry_timeout_decay: env_f64("OTTO_RETRY_TIMEOUT_DECAY", d.retry_timeout_decay),
            tool_response_max_tokens: env_usize("OTTO_TOOL_RESPONSE_MAX_TOKENS", d.tool_response_max_tokens),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_contracts_and_guardrails() {
        let f = EnvFlags::default();
        assert!(f.budget_contracts_enabled);
        assert!(f.guardrail_phase_a);
        assert!(f.guardrail_phase_b);
    }

    #[test]
    fn default_decay_factors_are_sub_unity() {
        let f = EnvFlags::default();
        assert!(f.retry_token_decay < 1.0 && f.retry_token_decay > 0.0);
        assert!(f.retry_timeout_decay < 1.0 && f.retry_timeout_decay > 0.0);
        assert!(f.tps_safety_factor < 1.0 && f.tps_safety_factor > 0.0);
    }

    #[test]
    fn env_bool_parses_truthy_variants() {
        std::env::set_var("OTTO_TEST_BOOL_A", "yes");
        assert!(env_bool("OTTO_TEST_BOOL_A", false));
        std::env::set_var("OTTO_TEST_BOOL_A", "0");
        assert!(!env_bool("OTTO_TEST_BOOL_A", true));
        std::env::remove_var("OTTO_TEST_BOOL_A");
    }

    #[test]
    fn env_f64_falls_back_on_garbage() {
        std::env::set_var("OTTO_TEST_F64_A", "not-a-number");
        assert_eq!(env_f64("OTTO_TEST_F64_A", 1.5), 1.5);
        std::env::remove_var("OTTO_TEST_F64_A");
    }

    #[test]
    fn from_env_with_clean_environment_matches_defaults() {
        // None of the OTTO_* vars are set in the test environment.
        let f = EnvFlags::from_env();
        let d = EnvFlags::default();
        assert_eq!(f.tool_response_max_tokens, d.tool_response_max_tokens);
        assert_eq!(f.budget_contracts_enabled, d.budget_contracts_enabled);
    }
}
