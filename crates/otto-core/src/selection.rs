// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};

use otto_tools::ToolSchema;

/// Tool schemas offered per call under normal conditions.
pub const BASE_MAX_TOOLS_OFFERED: usize = 80;
/// Ceiling used when context gives no ranking signal.
pub const SOFT_MAX_TOOLS_OFFERED: usize = 120;

const USAGE_WEIGHT: i64 = 20;

/// Cap and rank the tool schemas offered to the model.
///
/// Built-in tools are always kept.  Third-party tools are ranked by
/// context-keyword overlap plus recent-usage weight; ties break on a
/// deterministic per-task hash so the same task always sees the same
/// subset.  When the run is low-signal (nothing scored), the cap expands
/// toward the soft maximum and `epoch` rotates equal-score groups so no
/// tool is permanently hidden.
pub fn select_tool_schemas(
    schemas: Vec<ToolSchema>,
    builtins: &HashSet<String>,
    context: &str,
    usage_counts: &HashMap<String, u32>,
    task_id: &str,
    epoch: u64,
) -> Vec<ToolSchema> {
    if schemas.len() <= BASE_MAX_TOOLS_OFFERED {
        return schemas;
    }

    let context_tokens = tokenize(context);
    let (kept, ranked): (Vec<ToolSchema>, Vec<ToolSchema>) =
        schemas.into_iter().partition(|s| builtins.contains(&s.name));

    let mut scored: Vec<(i64, u64, ToolSchema)> = ranked
        .into_iter()
        .map(|s| {
            let overlap = keyword_overlap(&context_tokens, &s) as i64;
            let usage = usage_counts.get(&s.name).copied().unwrap_or(0) as i64 * USAGE_WEIGHT;
            let tie = fnv1a(&format!("{task_id}:{}", s.name));
            (overlap + usage, tie, s)
        })
        .collect();

    let low_signal = scored.iter().all(|(score, _, _)| *score == 0);
    let cap = if low_signal { SOFT_MAX_TOOLS_OFFERED } else { BASE_MAX_TOOLS_OFFERED };
    let slots = cap.saturating_sub(kept.len());

    if low_signal {
        // Rotate the (single, all-zero) tie group across epochs.
        scored.sort_by_key(|(_, tie, _)| tie.rotate_left((epoch % 64) as u32));
    } else {
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    }

    let mut out = kept;
    out.extend(scored.into_iter().take(slots).map(|(_, _, s)| s));
    out
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(str::to_string)
        .collect()
}

fn keyword_overlap(context: &HashSet<String>, schema: &ToolSchema) -> usize {
    let own = tokenize(&format!("{} {}", schema.name.replace('_', " "), schema.description));
    own.intersection(context).count()
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(name: &str, description: &str) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn many_schemas(n: usize) -> Vec<ToolSchema> {
        (0..n).map(|i| schema(&format!("vendor_tool_{i}"), "generic vendor integration")).collect()
    }

    #[test]
    fn small_sets_pass_through_unchanged() {
        let schemas = many_schemas(10);
        let out = select_tool_schemas(
            schemas.clone(),
            &HashSet::new(),
            "context",
            &HashMap::new(),
            "task",
            0,
        );
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn large_sets_are_capped() {
        let out = select_tool_schemas(
            many_schemas(200),
            &HashSet::new(),
            "",
            &HashMap::new(),
            "task",
            0,
        );
        assert!(out.len() <= SOFT_MAX_TOOLS_OFFERED);
    }

    #[test]
    fn builtins_are_always_kept() {
        let mut schemas = many_schemas(150);
        schemas.push(schema("read_file", "read a file"));
        let builtins: HashSet<String> = ["read_file".to_string()].into();
        let out = select_tool_schemas(schemas, &builtins, "", &HashMap::new(), "task", 0);
        assert!(out.iter().any(|s| s.name == "read_file"));
    }

    #[test]
    fn context_keywords_promote_matching_tools() {
        let mut schemas = many_schemas(120);
        schemas.push(schema("spreadsheet_export", "export tables to spreadsheet files"));
        let out = select_tool_schemas(
            schemas,
            &HashSet::new(),
            "please export the quarterly spreadsheet tables",
            &HashMap::new(),
            "task",
            0,
        );
        assert_eq!(out.len(), BASE_MAX_TOOLS_OFFERED);
        assert!(out.iter().any(|s| s.name == "spreadsheet_export"));
    }

    #[test]
    fn recent_usage_outranks_idle_tools() {
        let schemas = many_schemas(150);
        let mut usage = HashMap::new();
        usage.insert("vendor_tool_149".to_string(), 3u32);
        let out = select_tool_schemas(
            schemas,
            &HashSet::new(),
            "totally unrelated words here",
            &usage,
            "task",
            0,
        );
        assert!(out.iter().any(|s| s.name == "vendor_tool_149"));
    }

    #[test]
    fn selection_is_deterministic_per_task() {
        let a = select_tool_schemas(many_schemas(200), &HashSet::new(), "", &HashMap::new(), "task-a", 0);
        let b = select_tool_schemas(many_schemas(200), &HashSet::new(), "", &HashMap::new(), "task-a", 0);
        let names_a: Vec<&String> = a.iter().map(|s| &s.name).collect();
        let names_b: Vec<&String> = b.iter().map(|s| &s.name).collect();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn low_signal_runs_expand_to_soft_cap_and_rotate() {
        let first = select_tool_schemas(many_schemas(200), &HashSet::new(), "", &HashMap::new(), "t", 0);
        assert_eq!(first.len(), SOFT_MAX_TOOLS_OFFERED, "low-signal run expands the cap");
        let second = select_tool_schemas(many_schemas(200), &HashSet::new(), "", &HashMap::new(), "t", 1);
        let names_first: HashSet<String> = first.iter().map(|s| s.name.clone()).collect();
        let names_second: HashSet<String> = second.iter().map(|s| s.name.clone()).collect();
        assert_ne!(names_first, names_second, "epochs rotate the hidden subset");
    }
}
