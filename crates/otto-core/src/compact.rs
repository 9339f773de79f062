// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_model::Message;
use otto_tools::OutputCategory;

/// Pick how many leading messages to drop so that roughly `keep_n` recent
/// messages survive, then walk the boundary backward until it sits on a
/// clean conversation-turn edge.
///
/// If the boundary fell inside a tool interaction (the first surviving
/// message would carry tool_result blocks, or the last dropped message
/// carries the tool_use they answer), the compacted history would contain
/// orphaned results — references to tool_use ids that were dropped —
/// and the provider rejects the next request with a 400.  Walking backward
/// keeps the whole interaction group on the surviving side.
///
/// The most recent message is never part of the dropped range.
pub fn emergency_drop_range(messages: &[Message], keep_n: usize) -> usize {
    if messages.len() <= 1 {
        return 0;
    }
    let keep = keep_n.clamp(1, messages.len());
    let mut drop_count = messages.len() - keep;
    while drop_count > 0 {
        let first_kept = &messages[drop_count];
        if first_kept.has_tool_result() || first_kept.has_tool_use() {
            drop_count -= 1;
        } else {
            break;
        }
    }
    drop_count
}

// ─── Tool-result truncation ───────────────────────────────────────────────────

/// Cap a tool result to roughly `cap_tokens` tokens of text.
///
/// Oversized tool output is the main way a single turn blows the context
/// budget, and which part of the output is worth keeping depends on what
/// produced it.  The extraction strategy therefore follows the tool's
/// declared [`OutputCategory`], never its name:
///
/// - [`OutputCategory::HeadTail`] — process output.  The tail carries the
///   verdict (exit status, final error lines), so it gets the larger share
///   of the budget; the head keeps the invocation preamble.
/// - [`OutputCategory::MatchList`] — ranked matches.  Only leading entries
///   survive; relevance decays down the list, so the tail is worthless.
/// - [`OutputCategory::FileContent`] — an even head/tail split, keeping the
///   declarations at the top and the most recent content at the bottom.
/// - [`OutputCategory::Generic`] — a plain prefix, cut at a line boundary.
///
/// Every truncated result ends in a notice naming what was dropped and how
/// to reach the rest, so the model never mistakes a clipped result for a
/// complete one.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let budget = cap_tokens.saturating_mul(4);
    if content.len() <= budget {
        return content.to_string();
    }
    let dropped_bytes = content.len() - budget;

    match category {
        OutputCategory::HeadTail => {
            // Tail-weighted: 2/5 of the budget up front, the rest at the end.
            let head_budget = budget * 2 / 5;
            match split_keep(content, head_budget, budget - head_budget) {
                Some((head, tail, hidden)) => format!(
                    "{head}\n[-- {hidden} lines ({dropped_bytes} bytes) omitted from the \
                     middle of this output --]\n{tail}"
                ),
                None => prefix_cut(content, budget, dropped_bytes),
            }
        }
        OutputCategory::FileContent => {
            let half = budget / 2;
            match split_keep(content, half, budget - half) {
                Some((head, tail, hidden)) => format!(
                    "{head}\n[-- {hidden} lines omitted ({dropped_bytes} bytes); re-read \
                     with an offset/limit window for the rest --]\n{tail}"
                ),
                None => prefix_cut(content, budget, dropped_bytes),
            }
        }
        OutputCategory::MatchList => {
            let lines: Vec<&str> = content.lines().collect();
            let kept = take_prefix_lines(&lines, budget);
            let hidden = lines.len() - kept.len();
            if kept.is_empty() || hidden == 0 {
                return prefix_cut(content, budget, dropped_bytes);
            }
            format!(
                "{}\n[-- {hidden} further matches omitted ({dropped_bytes} bytes); narrow \
                 the pattern to see more --]",
                kept.join("\n")
            )
        }
        OutputCategory::Generic => prefix_cut(content, budget, dropped_bytes),
    }
}

/// Keep a head window and a tail window of whole lines within the given
/// byte budgets.  The tail only draws from lines the head did not take, so
/// the two windows can never overlap.  Returns `None` when the split keeps
/// nothing or hides nothing — callers fall back to a plain prefix cut.
fn split_keep(content: &str, head_budget: usize, tail_budget: usize) -> Option<(String, String, usize)> {
    let lines: Vec<&str> = content.lines().collect();
    let head = take_prefix_lines(&lines, head_budget);
    let tail = take_suffix_lines(&lines[head.len()..], tail_budget);
    let hidden = lines.len() - head.len() - tail.len();
    if hidden == 0 || (head.is_empty() && tail.is_empty()) {
        return None;
    }
    Some((head.join("\n"), tail.join("\n"), hidden))
}

/// Greedily take whole lines from the front until the byte budget runs out.
fn take_prefix_lines<'a>(lines: &[&'a str], budget: usize) -> Vec<&'a str> {
    let mut spent = 0usize;
    let mut kept = Vec::new();
    for line in lines {
        spent += line.len() + 1;
        if spent > budget {
            break;
        }
        kept.push(*line);
    }
    kept
}

/// Greedily take whole lines from the back until the byte budget runs out,
/// preserving their original order.
fn take_suffix_lines<'a>(lines: &[&'a str], budget: usize) -> Vec<&'a str> {
    let mut spent = 0usize;
    let mut kept = std::collections::VecDeque::new();
    for line in lines.iter().rev() {
        spent += line.len() + 1;
        if spent > budget {
            break;
        }
        kept.push_front(*line);
    }
    kept.into_iter().collect()
}

/// Plain prefix cut: back off to a UTF-8 boundary, then to the last full
/// line if one fits, and append the omission notice.
fn prefix_cut(content: &str, budget: usize, dropped_bytes: usize) -> String {
    let mut cut = budget.min(content.len());
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let keep = match content[..cut].rfind('\n') {
        Some(nl) if nl > 0 => &content[..nl],
        _ => &content[..cut],
    };
    format!("{keep}\n[-- truncated to fit the context budget; {dropped_bytes} bytes omitted --]")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
