// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tracing::warn;

/// Resolve the accumulated argument text of a tool use into a JSON object.
///
/// Providers require tool_use input to be an object — anything else poisons
/// the *next* request when the history is sent back, surfacing as an opaque
/// 400 long after the bad turn.  So this never fails: whatever arrives is
/// normalized to an object, and anything unusable degrades to `{}` with a
/// warning so the tool's own schema validation can produce a readable error
/// for the model instead.
///
/// Streamed arguments arrive in a handful of broken shapes, each handled in
/// order: fenced (` ```json ... ``` `), double-encoded (the object
/// serialized *as a JSON string*), a non-object value, or mangled JSON that
/// [`salvage_object`] can rebuild.
pub fn parse_tool_input(tool_name: &str, tool_use_id: &str, raw: &str) -> serde_json::Value {
    let fragment = strip_code_fence(raw.trim());
    if fragment.is_empty() {
        warn!(tool_name, tool_use_id, "tool use arrived with no arguments; using {{}}");
        return empty_object();
    }
    match serde_json::from_str::<serde_json::Value>(fragment) {
        Ok(value) if value.is_object() => value,
        Ok(serde_json::Value::String(inner)) => {
            // Double-encoded: the model serialized its argument object and
            // then sent that serialization as a string.
            match serde_json::from_str::<serde_json::Value>(&inner) {
                Ok(v) if v.is_object() => {
                    warn!(tool_name, tool_use_id, "unwrapped double-encoded tool arguments");
                    v
                }
                _ => {
                    warn!(tool_name, tool_use_id, "tool arguments were a bare string; using {{}}");
                    empty_object()
                }
            }
        }
        Ok(_) => {
            warn!(
                tool_name,
                tool_use_id, "tool arguments were valid JSON but not an object; using {{}}"
            );
            empty_object()
        }
        Err(parse_err) => match salvage_object(fragment) {
            Some(v) => {
                warn!(tool_name, tool_use_id, "rebuilt mangled tool arguments");
                v
            }
            None => {
                warn!(
                    tool_name,
                    tool_use_id,
                    error = %parse_err,
                    "tool arguments unusable after salvage; using {{}}"
                );
                empty_object()
            }
        },
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Peel a markdown code fence off a fragment, tolerating a language tag
/// after the opening backticks and a missing closing fence.
fn strip_code_fence(s: &str) -> &str {
    let Some(body) = s.strip_prefix("```") else {
        return s;
    };
    let body = body.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim()
}

/// Rebuild a parseable object from a fragment the model mangled.
///
/// One pass over the text covers the two failure shapes streamed arguments
/// actually exhibit: invalid escape sequences inside string values, and
/// truncation mid-structure when the stream was cut off.  The pass copies
/// the fragment while literalizing bad escapes (`\p` → `\\p`: the model
/// meant a literal backslash) and keeps a stack of the closers the
/// fragment still owes.  Afterwards an unterminated string is closed, a
/// dangling `"key":` gets a `null`, a trailing comma is dropped, and the
/// owed closers are appended innermost-first.
///
/// Returns `None` unless the rebuilt text parses into a JSON object.
fn salvage_object(fragment: &str) -> Option<serde_json::Value> {
    const VALID_ESCAPES: [char; 9] = ['"', '\\', '/', 'b', 'f', 'n', 'r', 't', 'u'];
    let mut rebuilt = String::with_capacity(fragment.len() + 8);
    let mut owed: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut chars = fragment.chars();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '"' => {
                    in_string = false;
                    rebuilt.push('"');
                }
                '\\' => match chars.next() {
                    Some(next) if VALID_ESCAPES.contains(&next) => {
                        rebuilt.push('\\');
                        rebuilt.push(next);
                    }
                    Some(next) => {
                        rebuilt.push_str("\\\\");
                        rebuilt.push(next);
                    }
                    // A lone backslash at the cut point carries nothing.
                    None => {}
                },
                _ => rebuilt.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    rebuilt.push('"');
                }
                '{' => {
                    owed.push('}');
                    rebuilt.push('{');
                }
                '[' => {
                    owed.push(']');
                    rebuilt.push('[');
                }
                '}' | ']' => {
                    if owed.last() == Some(&c) {
                        owed.pop();
                    }
                    rebuilt.push(c);
                }
                _ => rebuilt.push(c),
            }
        }
    }

    if in_string {
        rebuilt.push('"');
    }
    let trimmed = rebuilt.trim_end().len();
    rebuilt.truncate(trimmed);
    if rebuilt.ends_with(',') {
        rebuilt.pop();
    }
    if rebuilt.ends_with(':') {
        rebuilt.push_str(" null");
    }
    for closer in owed.into_iter().rev() {
        rebuilt.push(closer);
    }

    serde_json::from_str::<serde_json::Value>(&rebuilt).ok().filter(|v| v.is_object())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn is_empty_object(v: &serde_json::Value) -> bool {
        v.as_object().map(|o| o.is_empty()).unwrap_or(false)
    }

    // ── Clean inputs ──────────────────────────────────────────────────────────

    #[test]
    fn empty_args_become_empty_object() {
        assert!(is_empty_object(&parse_tool_input("t", "id", "")));
        assert!(is_empty_object(&parse_tool_input("t", "id", "   ")));
    }

    #[test]
    fn valid_object_passes_through() {
        let v = parse_tool_input("t", "id", r#"{"path": "/tmp/x"}"#);
        assert_eq!(v["path"], "/tmp/x");
    }

    // ── Wrapper shapes ────────────────────────────────────────────────────────

    #[test]
    fn fenced_object_is_unwrapped() {
        let v = parse_tool_input("t", "id", "```json\n{\"query\": \"rust\"}\n```");
        assert_eq!(v["query"], "rust");
    }

    #[test]
    fn fence_without_closing_backticks_still_unwraps() {
        let v = parse_tool_input("t", "id", "```\n{\"a\": 1}");
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn double_encoded_object_is_unwrapped() {
        let v = parse_tool_input("t", "id", r#""{\"path\": \"/w/readme\"}""#);
        assert_eq!(v["path"], "/w/readme");
    }

    #[test]
    fn bare_string_and_non_object_values_degrade_to_empty() {
        assert!(is_empty_object(&parse_tool_input("t", "id", r#""just words""#)));
        assert!(is_empty_object(&parse_tool_input("t", "id", "[1, 2, 3]")));
        assert!(is_empty_object(&parse_tool_input("t", "id", "42")));
    }

    // ── Salvage ───────────────────────────────────────────────────────────────

    #[test]
    fn invalid_escape_is_literalized() {
        // `\p` is not a JSON escape; the model meant a literal backslash.
        let v = parse_tool_input("t", "id", r#"{"re": "a\pb"}"#);
        assert_eq!(v["re"], "a\\pb");
    }

    #[test]
    fn valid_escapes_survive_salvage() {
        // Force the salvage path with a truncated tail, then check the
        // legitimate escapes in front of it came through untouched.
        let v = parse_tool_input("t", "id", r#"{"a": "line\nbreak \"quoted\"", "b": "tail"#);
        assert_eq!(v["a"], "line\nbreak \"quoted\"");
        assert_eq!(v["b"], "tail");
    }

    #[test]
    fn truncated_string_is_closed() {
        let v = parse_tool_input("t", "id", r#"{"query": "unfinished"#);
        assert_eq!(v["query"], "unfinished");
    }

    #[test]
    fn truncated_nested_structure_is_balanced() {
        let v = parse_tool_input("t", "id", r#"{"filters": {"tags": ["a", "b"#);
        assert_eq!(v["filters"]["tags"][0], "a");
        assert_eq!(v["filters"]["tags"][1], "b");
    }

    #[test]
    fn dangling_key_completes_with_null() {
        let v = parse_tool_input("t", "id", r#"{"path": "/w/x", "offset":"#);
        assert_eq!(v["path"], "/w/x");
        assert!(v["offset"].is_null());
    }

    #[test]
    fn trailing_comma_is_dropped() {
        let v = parse_tool_input("t", "id", r#"{"path": "/w/x","#);
        assert_eq!(v["path"], "/w/x");
    }

    #[test]
    fn unrepairable_garbage_becomes_empty_object() {
        assert!(is_empty_object(&parse_tool_input("t", "id", "[[[:::")));
        assert!(is_empty_object(&parse_tool_input("t", "id", "not json at all")));
    }

    #[test]
    fn salvage_rejects_non_object_results() {
        // Balances cleanly, but the top level is an array — still not a
        // legal tool input.
        assert!(salvage_object(r#"["a", "b"#).is_none());
    }
}
