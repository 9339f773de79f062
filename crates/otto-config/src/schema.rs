// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_max_turns() -> u32 {
    100
}

fn default_quality_passes() -> u8 {
    1
}

// ─── Mode / domain / profile enums ────────────────────────────────────────────

/// How much mutation the executor may perform.
///
/// - `Execute` — full read/write tool access.
/// - `Propose` — read-only exploration; mutating tools are gated off and the
///   deliverable is a proposal.
/// - `Analyze` — like `Propose` but the deliverable is analysis only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Execute,
    Propose,
    Analyze,
}

impl ExecutionMode {
    /// Mutating tools are only admitted in `Execute` mode.
    pub fn allows_mutation(&self) -> bool {
        matches!(self, ExecutionMode::Execute)
    }
}

/// Coarse task domain.  Drives loop-detector window sizes, tool policy, and
/// completion evidence requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskDomain {
    Code,
    Research,
    General,
    Operations,
    #[default]
    Auto,
}

impl TaskDomain {
    /// Domains in which shell/code-execution tools are appropriate.
    pub fn allows_technical_tools(&self) -> bool {
        !matches!(self, TaskDomain::Research)
    }
}

/// Top-level conversation shape.  `Task` is the full plan/execute lifecycle;
/// the other modes are thinner wrappers owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    #[default]
    Task,
    Chat,
    Think,
    Hybrid,
}

/// Named budget profile requested on the task.  `Auto` derives a profile
/// from `max_turns` (see [`BudgetContract::resolve`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetProfile {
    Strict,
    Balanced,
    Aggressive,
    #[default]
    Auto,
}

// ─── Budget contracts ─────────────────────────────────────────────────────────

/// Per-profile budget caps enforced by the budget governor.
///
/// `max_turns` here is the profile ceiling; the effective turn limit is the
/// smaller of this and the task's own `max_turns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetContract {
    pub max_turns: u32,
    pub max_tool_calls: u32,
    pub max_web_search_calls: u32,
    pub max_consecutive_search_steps: u32,
    pub max_auto_recovery_steps: u32,
}

impl BudgetContract {
    pub const STRICT: BudgetContract = BudgetContract {
        max_turns: 30,
        max_tool_calls: 40,
        max_web_search_calls: 8,
        max_consecutive_search_steps: 3,
        max_auto_recovery_steps: 2,
    };

    pub const BALANCED: BudgetContract = BudgetContract {
        max_turns: 60,
        max_tool_calls: 100,
        max_web_search_calls: 15,
        max_consecutive_search_steps: 4,
        max_auto_recovery_steps: 3,
    };

    pub const AGGRESSIVE: BudgetContract = BudgetContract {
        max_turns: 120,
        max_tool_calls: 250,
        max_web_search_calls: 30,
        max_consecutive_search_steps: 6,
        max_auto_recovery_steps: 5,
    };

    /// Resolve the contract for a requested profile and the task's turn cap.
    ///
    /// `Auto` picks the tightest profile whose turn ceiling accommodates
    /// `max_turns`; explicit profiles are honored as-is.
    pub fn resolve(profile: BudgetProfile, max_turns: u32) -> BudgetContract {
        match profile {
            BudgetProfile::Strict => Self::STRICT,
            BudgetProfile::Balanced => Self::BALANCED,
            BudgetProfile::Aggressive => Self::AGGRESSIVE,
            BudgetProfile::Auto => {
                if max_turns <= Self::STRICT.max_turns {
                    Self::STRICT
                } else if max_turns <= 80 {
                    Self::BALANCED
                } else {
                    Self::AGGRESSIVE
                }
            }
        }
    }
}

// ─── Agent configuration ──────────────────────────────────────────────────────

/// Per-task executor configuration.
///
/// Every knob the executor recognizes is listed here explicitly; hosts that
/// carry extra options must strip them before constructing this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Global turn ceiling across all steps and follow-ups.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Optional hard cap on cumulative output tokens.
    pub max_tokens: Option<u64>,
    /// Optional hard cap on cumulative cost in USD.
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub budget_profile: BudgetProfile,
    #[serde(default)]
    pub conversation_mode: ConversationMode,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub task_domain: TaskDomain,
    /// Free-form intent tag forwarded from the host (e.g. "bugfix").
    pub task_intent: Option<String>,
    /// Deep-work tasks get longer step deadlines and research-flavoured
    /// recovery steps (web_search + scratchpad).
    #[serde(default)]
    pub deep_work_mode: bool,
    #[serde(default)]
    pub progress_journal_enabled: bool,
    #[serde(default)]
    pub auto_report_enabled: bool,
    /// Run a verification pass with a dedicated agent after the plan.
    #[serde(default)]
    pub verification_agent: bool,
    /// Whether the task may pause and wait for user input at all.
    #[serde(default = "default_true")]
    pub allow_user_input: bool,
    /// Pause when the model asks a blocking required-decision question.
    #[serde(default = "default_true")]
    pub pause_for_required_decision: bool,
    /// Autonomous tasks never pause for input even when a question is asked.
    #[serde(default)]
    pub autonomous_mode: bool,
    #[serde(default = "default_true")]
    pub retain_memory: bool,
    #[serde(default)]
    pub allow_shared_context_memory: bool,
    /// Deny-list of tool names; supports a trailing `*` wildcard per entry.
    #[serde(default)]
    pub tool_restrictions: Vec<String>,
    /// Allow-list of tool names; empty means "all registered tools".
    /// Supports a trailing `*` wildcard per entry.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// 1–3 quality passes over the final deliverable.
    #[serde(default = "default_quality_passes")]
    pub quality_passes: u8,
    /// Named model profile requested by the task (host-resolved).
    pub llm_profile: Option<String>,
    /// When true the profile must not be silently downgraded.
    #[serde(default)]
    pub llm_profile_forced: bool,
    /// Personality/prompt-composition id; opaque to the executor.
    pub personality_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: None,
            max_cost_usd: None,
            budget_profile: BudgetProfile::default(),
            conversation_mode: ConversationMode::default(),
            execution_mode: ExecutionMode::default(),
            task_domain: TaskDomain::default(),
            task_intent: None,
            deep_work_mode: false,
            progress_journal_enabled: false,
            auto_report_enabled: false,
            verification_agent: false,
            allow_user_input: true,
            pause_for_required_decision: true,
            autonomous_mode: false,
            retain_memory: true,
            allow_shared_context_memory: false,
            tool_restrictions: Vec::new(),
            allowed_tools: Vec::new(),
            quality_passes: default_quality_passes(),
            llm_profile: None,
            llm_profile_forced: false,
            personality_id: None,
        }
    }
}

impl AgentConfig {
    /// Whether `tool` passes the allow/deny lists.
    ///
    /// Deny wins over allow.  List entries match exactly or, with a trailing
    /// `*`, as a prefix (`browser_*` matches `browser_click`).  A bare `*`
    /// matches everything.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if self.tool_restrictions.iter().any(|p| pattern_matches(p, tool)) {
            return false;
        }
        if self.allowed_tools.is_empty() {
            return true;
        }
        self.allowed_tools.iter().any(|p| pattern_matches(p, tool))
    }

    /// The budget contract in effect for this config.
    pub fn budget_contract(&self) -> BudgetContract {
        BudgetContract::resolve(self.budget_profile, self.max_turns)
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────────────────────

    #[test]
    fn default_max_turns_is_100() {
        assert_eq!(AgentConfig::default().max_turns, 100);
    }

    #[test]
    fn default_execution_mode_is_execute() {
        assert_eq!(AgentConfig::default().execution_mode, ExecutionMode::Execute);
    }

    #[test]
    fn default_allows_user_input() {
        let c = AgentConfig::default();
        assert!(c.allow_user_input);
        assert!(c.pause_for_required_decision);
    }

    #[test]
    fn default_budget_profile_is_auto() {
        assert_eq!(AgentConfig::default().budget_profile, BudgetProfile::Auto);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let c: AgentConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.max_turns, 100);
        assert!(c.allow_user_input, "serde default must use default_true");
    }

    // ── Budget contract resolution ───────────────────────────────────────────

    #[test]
    fn explicit_profile_is_honored() {
        let c = BudgetContract::resolve(BudgetProfile::Strict, 500);
        assert_eq!(c, BudgetContract::STRICT);
    }

    #[test]
    fn auto_profile_low_turns_resolves_strict() {
        let c = BudgetContract::resolve(BudgetProfile::Auto, 20);
        assert_eq!(c, BudgetContract::STRICT);
    }

    #[test]
    fn auto_profile_mid_turns_resolves_balanced() {
        let c = BudgetContract::resolve(BudgetProfile::Auto, 60);
        assert_eq!(c, BudgetContract::BALANCED);
    }

    #[test]
    fn auto_profile_high_turns_resolves_aggressive() {
        let c = BudgetContract::resolve(BudgetProfile::Auto, 100);
        assert_eq!(c, BudgetContract::AGGRESSIVE);
    }

    #[test]
    fn profiles_are_strictly_ordered() {
        assert!(BudgetContract::STRICT.max_tool_calls < BudgetContract::BALANCED.max_tool_calls);
        assert!(BudgetContract::BALANCED.max_tool_calls < BudgetContract::AGGRESSIVE.max_tool_calls);
    }

    // ── Tool allow/deny lists ────────────────────────────────────────────────

    #[test]
    fn empty_lists_allow_everything() {
        let c = AgentConfig::default();
        assert!(c.tool_allowed("read_file"));
        assert!(c.tool_allowed("anything_at_all"));
    }

    #[test]
    fn allow_list_restricts_to_listed_tools() {
        let c = AgentConfig {
            allowed_tools: vec!["read_file".into(), "web_search".into()],
            ..AgentConfig::default()
        };
        assert!(c.tool_allowed("read_file"));
        assert!(!c.tool_allowed("run_command"));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let c = AgentConfig {
            allowed_tools: vec!["*".into()],
            tool_restrictions: vec!["run_command".into()],
            ..AgentConfig::default()
        };
        assert!(!c.tool_allowed("run_command"));
        assert!(c.tool_allowed("read_file"));
    }

    #[test]
    fn wildcard_prefix_matches() {
        let c = AgentConfig {
            tool_restrictions: vec!["browser_*".into()],
            ..AgentConfig::default()
        };
        assert!(!c.tool_allowed("browser_click"));
        assert!(!c.tool_allowed("browser_navigate"));
        assert!(c.tool_allowed("browse")); // prefix is "browser_", not "browse"
    }

    #[test]
    fn bare_star_restriction_denies_all() {
        let c = AgentConfig {
            tool_restrictions: vec!["*".into()],
            ..AgentConfig::default()
        };
        assert!(!c.tool_allowed("read_file"));
    }

    // ── Mode helpers ─────────────────────────────────────────────────────────

    #[test]
    fn propose_and_analyze_disallow_mutation() {
        assert!(ExecutionMode::Execute.allows_mutation());
        assert!(!ExecutionMode::Propose.allows_mutation());
        assert!(!ExecutionMode::Analyze.allows_mutation());
    }

    #[test]
    fn research_domain_forbids_technical_tools() {
        assert!(!TaskDomain::Research.allows_technical_tools());
        assert!(TaskDomain::Code.allows_technical_tools());
    }

    // ── Serde round-trip ─────────────────────────────────────────────────────

    #[test]
    fn config_round_trips_through_yaml() {
        let c = AgentConfig {
            max_turns: 42,
            deep_work_mode: true,
            task_domain: TaskDomain::Research,
            budget_profile: BudgetProfile::Strict,
            ..AgentConfig::default()
        };
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: AgentConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.max_turns, 42);
        assert!(back.deep_work_mode);
        assert_eq!(back.task_domain, TaskDomain::Research);
        assert_eq!(back.budget_profile, BudgetProfile::Strict);
    }

    #[test]
    fn mode_enums_serialize_lowercase() {
        let yaml = serde_yaml::to_string(&ExecutionMode::Propose).unwrap();
        assert_eq!(yaml.trim(), "propose");
        let yaml = serde_yaml::to_string(&TaskDomain::Operations).unwrap();
        assert_eq!(yaml.trim(), "operations");
    }
}
