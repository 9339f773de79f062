// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_config::{EnvFlags, ExecutionMode, TaskDomain};
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::task::Task;

/// Per-task completion requirements derived from the title and prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionContract {
    pub requires_direct_answer: bool,
    pub requires_decision_signal: bool,
    pub requires_verification_evidence: bool,
    pub requires_artifact_evidence: bool,
    pub requires_execution_evidence: bool,
}

const DECISION_VERBS: [&str; 7] =
    ["choose", "decide", "recommend", "pick", "select", "compare", "evaluate"];
const EXECUTION_VERBS: [&str; 8] =
    ["run", "execute", "deploy", "install", "migrate", "build", "restart", "apply"];
const HIGH_RISK_CLAIMS: [&str; 6] =
    ["released", "funding", "acquired", "launched", "raised", "announced"];

impl CompletionContract {
    /// Derive the contract from task heuristics.
    pub fn derive(task: &Task) -> Self {
        let text = format!("{} {}", task.title, task.prompt).to_lowercase();
        let config = &task.agent_config;

        let asks_question = task.prompt.contains('?')
            || ["should ", "which ", "what ", "is it ", "can we ", "how many "]
                .iter()
                .any(|p| text.starts_with(p) || text.contains(&format!(". {p}")));
        let has_decision_verb = DECISION_VERBS.iter().any(|v| text.contains(v));
        let has_decision_target =
            text.contains(" between ") || text.contains(" or ") || text.contains("option");

        let wants_document = text.contains("write a document")
            || text.contains("write a report")
            || text.contains("create a file")
            || text.contains("save to")
            || mentions_file_extension(&text);

        let execution_shaped = config.execution_mode == ExecutionMode::Execute
            && matches!(config.task_domain, TaskDomain::Code | TaskDomain::Operations)
            && EXECUTION_VERBS.iter().any(|v| {
                text.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *v)
            });

        let verification_shaped =
            text.contains("verify") || text.contains("verification") || config.verification_agent;

        Self {
            requires_direct_answer: asks_question || has_decision_verb,
            requires_decision_signal: has_decision_verb && has_decision_target,
            requires_verification_evidence: verification_shaped,
            requires_artifact_evidence: wants_document,
            requires_execution_evidence: execution_shaped,
        }
    }
}

fn mentions_file_extension(text: &str) -> bool {
    for ext in [".md", ".csv", ".json", ".html", ".txt", ".pdf", ".xlsx", ".py", ".rs", ".yaml"] {
        if text.contains(ext) {
            return true;
        }
    }
    false
}

/// Evidence gathered over the run, evaluated against the contract at
/// finalization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionEvidence {
    /// At least one execution-class tool call succeeded.
    pub execution_succeeded: bool,
    /// Paths of artifacts created or mutated during the run.
    pub artifacts: Vec<String>,
    /// Verification steps ended with an OK signal (or an explicit problem
    /// list, which also satisfies the contract).
    pub verification_concluded: bool,
    /// web_fetch sources observed with a parseable publish date.
    pub dated_sources: usize,
}

/// The completion oracle: the last gate before a task may finalize as
/// completed.
#[derive(Debug)]
pub struct CompletionOracle {
    contract: CompletionContract,
    prompt: String,
    domain: TaskDomain,
    flags: EnvFlags,
}

impl CompletionOracle {
    pub fn new(task: &Task, flags: EnvFlags) -> Self {
        Self {
            contract: CompletionContract::derive(task),
            prompt: task.prompt.clone(),
            domain: task.agent_config.task_domain,
            flags,
        }
    }

    pub fn contract(&self) -> &CompletionContract {
        &self.contract
    }

    /// Guard evaluation.  `Ok(())` means the candidate may finalize;
    /// `Err` carries the first violated requirement.
    ///
    /// Phase A gates the answer-shape checks, phase B the evidence checks;
    /// either can be disabled process-wide.
    pub fn check(
        &self,
        candidate: Option<&str>,
        evidence: &CompletionEvidence,
    ) -> Result<(), ExecutorError> {
        let Some(text) = candidate.map(str::trim).filter(|t| !t.is_empty()) else {
            return Err(guard("no substantive final text to present as the answer"));
        };

        if self.flags.guardrail_phase_a {
            if self.contract.requires_direct_answer && !answers_directly(&self.prompt, text) {
                return Err(guard("final text does not directly address the prompt"));
            }
            if self.contract.requires_decision_signal && !contains_decision_signal(text) {
                return Err(guard("prompt demands a decision but none was stated"));
            }
        }

        if self.flags.guardrail_phase_b {
            if self.contract.requires_execution_evidence && !evidence.execution_succeeded {
                return Err(guard("execution was required but no execution tool call succeeded"));
            }
            if self.contract.requires_artifact_evidence && evidence.artifacts.is_empty() {
                return Err(guard("an artifact was required but none was created"));
            }
            if self.contract.requires_verification_evidence && !evidence.verification_concluded {
                return Err(guard("verification evidence is missing"));
            }
            if self.domain == TaskDomain::Research
                && makes_high_risk_claim(text)
                && evidence.dated_sources == 0
            {
                return Err(guard(
                    "high-risk research claim without a dated web source to back it",
                ));
            }
        }
        Ok(())
    }
}

fn guard(detail: &str) -> ExecutorError {
    ExecutorError::CompletionGuard { detail: detail.to_string() }
}

/// Whether the final text plausibly answers the prompt directly rather than
/// narrating process.  Shape checks only — a trailing question, a text that
/// shares no vocabulary with the prompt, or a bare status line all fail.
fn answers_directly(prompt: &str, text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.ends_with('?') {
        return false;
    }
    if trimmed.split_whitespace().count() < 5 {
        return false;
    }
    let keywords: Vec<String> = prompt
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect();
    if keywords.is_empty() {
        return true;
    }
    let lower = text.to_lowercase();
    let hits = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
    hits * 5 >= keywords.len() // ≥ 20% keyword overlap
}

fn contains_decision_signal(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["recommend", "i would go with", "the better choice", "you should", "the answer is", "decision:"]
        .iter()
        .any(|m| lower.contains(m))
}

fn makes_high_risk_claim(text: &str) -> bool {
    let lower = text.to_lowercase();
    HIGH_RISK_CLAIMS.iter().any(|m| lower.contains(m))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_config::AgentConfig;

    fn task_with_prompt(prompt: &str) -> Task {
        Task::new("t1", "Task", prompt)
    }

    fn oracle_for(prompt: &str) -> CompletionOracle {
        CompletionOracle::new(&task_with_prompt(prompt), EnvFlags::default())
    }

    // ── Contract derivation ───────────────────────────────────────────────────

    #[test]
    fn question_prompt_requires_direct_answer() {
        let c = CompletionContract::derive(&task_with_prompt("Which database should we use?"));
        assert!(c.requires_direct_answer);
    }

    #[test]
    fn decision_prompt_requires_decision_signal() {
        let c = CompletionContract::derive(&task_with_prompt(
            "Compare Postgres or SQLite and recommend one between them",
        ));
        assert!(c.requires_decision_signal);
    }

    #[test]
    fn document_prompt_requires_artifact() {
        let c = CompletionContract::derive(&task_with_prompt("Write a report and save it as summary.md"));
        assert!(c.requires_artifact_evidence);
    }

    #[test]
    fn execution_contract_needs_mode_domain_and_verb() {
        let mut task = task_with_prompt("Run the migration against staging");
        task.agent_config = AgentConfig {
            execution_mode: ExecutionMode::Execute,
            task_domain: TaskDomain::Operations,
            ..AgentConfig::default()
        };
        assert!(CompletionContract::derive(&task).requires_execution_evidence);

        task.agent_config.execution_mode = ExecutionMode::Propose;
        assert!(!CompletionContract::derive(&task).requires_execution_evidence);
    }

    #[test]
    fn verification_tagged_prompt_requires_verification() {
        let c = CompletionContract::derive(&task_with_prompt("Verify the backup restore works"));
        assert!(c.requires_verification_evidence);
    }

    #[test]
    fn plain_prompt_requires_nothing_special() {
        let c = CompletionContract::derive(&task_with_prompt("Tidy up the notes folder"));
        assert!(!c.requires_direct_answer);
        assert!(!c.requires_artifact_evidence);
        assert!(!c.requires_execution_evidence);
    }

    // ── Guard checks ──────────────────────────────────────────────────────────

    #[test]
    fn empty_candidate_always_fails() {
        let oracle = oracle_for("Summarize the readme");
        let err = oracle.check(None, &CompletionEvidence::default());
        assert!(matches!(err, Err(ExecutorError::CompletionGuard { .. })));
        let err = oracle.check(Some("   "), &CompletionEvidence::default());
        assert!(err.is_err());
    }

    #[test]
    fn direct_answer_passes_when_on_topic() {
        let oracle = oracle_for("Which database engine fits an embedded deployment?");
        let answer = "For an embedded deployment the database engine I recommend is SQLite: \
                      zero-configuration, in-process, and well supported.";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_ok());
    }

    #[test]
    fn off_topic_answer_fails_direct_answer_check() {
        let oracle = oracle_for("Which database engine fits an embedded deployment?");
        let answer = "I explored several directories and listed many interesting things today.";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_err());
    }

    #[test]
    fn trailing_question_is_not_an_answer() {
        let oracle = oracle_for("Which database should we use?");
        let answer = "There are many database options to use here — which one do you prefer?";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_err());
    }

    #[test]
    fn execution_evidence_is_enforced() {
        let mut task = task_with_prompt("Run the build and report the outcome of the build run");
        task.agent_config = AgentConfig {
            execution_mode: ExecutionMode::Execute,
            task_domain: TaskDomain::Code,
            ..AgentConfig::default()
        };
        let oracle = CompletionOracle::new(&task, EnvFlags::default());
        let answer = "The build run finished: the build completed green and the report is above.";
        let no_evidence = CompletionEvidence::default();
        assert!(oracle.check(Some(answer), &no_evidence).is_err());
        let with_evidence =
            CompletionEvidence { execution_succeeded: true, ..CompletionEvidence::default() };
        assert!(oracle.check(Some(answer), &with_evidence).is_ok());
    }

    #[test]
    fn artifact_evidence_is_enforced() {
        let oracle = oracle_for("Write a summary and save it to summary.md");
        let answer = "The summary was written and saved to summary.md as requested.";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_err());
        let evidence = CompletionEvidence {
            artifacts: vec!["summary.md".into()],
            ..CompletionEvidence::default()
        };
        assert!(oracle.check(Some(answer), &evidence).is_ok());
    }

    #[test]
    fn high_risk_research_claim_needs_dated_source() {
        let mut task = task_with_prompt("What is new with the Acme platform this month?");
        task.agent_config.task_domain = TaskDomain::Research;
        let oracle = CompletionOracle::new(&task, EnvFlags::default());
        let answer = "Acme launched a new platform tier this month, and the Acme team \
                      announced expanded availability in three new regions.";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_err());
        let evidence = CompletionEvidence { dated_sources: 1, ..CompletionEvidence::default() };
        assert!(oracle.check(Some(answer), &evidence).is_ok());
    }

    #[test]
    fn disabled_guardrail_phases_skip_their_checks() {
        let task = task_with_prompt("Which option should we take?");
        let flags = EnvFlags {
            guardrail_phase_a: false,
            guardrail_phase_b: false,
            ..EnvFlags::default()
        };
        let oracle = CompletionOracle::new(&task, flags);
        // Off-topic, no decision signal — passes because phases are off.
        let answer = "Work happened and things were looked at in several places overall.";
        assert!(oracle.check(Some(answer), &CompletionEvidence::default()).is_ok());
    }
}
