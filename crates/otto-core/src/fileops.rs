// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Writing an HTML file smaller than this shortly after a failed web fetch
/// is treated as the model faking the page it could not fetch.
const TINY_HTML_BYTES: usize = 2_048;
const WEB_FETCH_GUARD_MINUTES: i64 = 2;

/// Tracks file reads, directory listings, and mutations across a task.
///
/// Serves three purposes: rejecting redundant reads, answering redundant
/// directory listings from cache, and refusing the fetch-then-fake-HTML
/// pattern.  State is serializable because it rides along in conversation
/// snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOperationTracker {
    /// Paths read since the last mutation of each, in first-read order.
    read_paths: Vec<String>,
    /// Cached directory listings.
    listings: HashMap<String, String>,
    last_web_fetch_failure: Option<DateTime<Utc>>,
}

impl FileOperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Whether reading `path` again would be redundant.
    pub fn is_redundant_read(&self, path: &str) -> bool {
        self.read_paths.iter().any(|p| p == path)
    }

    pub fn record_read(&mut self, path: &str) {
        if !self.is_redundant_read(path) {
            self.read_paths.push(path.to_string());
        }
    }

    /// Paths read so far, oldest first (feeds the step knowledge summary).
    pub fn files_read(&self) -> &[String] {
        &self.read_paths
    }

    // ── Directory listings ────────────────────────────────────────────────────

    /// Cached listing for a directory, if the model already asked.
    pub fn cached_listing(&self, path: &str) -> Option<&str> {
        self.listings.get(path).map(|s| s.as_str())
    }

    pub fn record_listing(&mut self, path: &str, listing: &str) {
        self.listings.insert(path.to_string(), listing.to_string());
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// A successful mutation invalidates the read cache for the path and the
    /// listing cache for its parent directory (the listing changed).
    pub fn record_mutation(&mut self, path: &str) {
        self.read_paths.retain(|p| p != path);
        if let Some(parent) = parent_dir(path) {
            self.listings.remove(&parent);
        }
        self.listings.remove(path);
    }

    // ── Web-fetch guard ───────────────────────────────────────────────────────

    pub fn record_web_fetch_failure(&mut self, at: DateTime<Utc>) {
        self.last_web_fetch_failure = Some(at);
    }

    /// Refuse writing a tiny HTML file shortly after a failed web fetch.
    pub fn refuses_html_write(&self, path: &str, content: &str, now: DateTime<Utc>) -> bool {
        let Some(failed_at) = self.last_web_fetch_failure else {
            return false;
        };
        let is_html = path.ends_with(".html") || path.ends_with(".htm");
        let is_tiny = content.len() < TINY_HTML_BYTES;
        let recent = now - failed_at <= ChronoDuration::minutes(WEB_FETCH_GUARD_MINUTES);
        is_html && is_tiny && recent
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map(|i| {
        if i == 0 {
            "/".to_string()
        } else {
            trimmed[..i].to_string()
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_read_of_same_path_is_redundant() {
        let mut t = FileOperationTracker::new();
        assert!(!t.is_redundant_read("/w/readme"));
        t.record_read("/w/readme");
        assert!(t.is_redundant_read("/w/readme"));
        assert!(!t.is_redundant_read("/w/other"));
    }

    #[test]
    fn mutation_invalidates_read_cache() {
        let mut t = FileOperationTracker::new();
        t.record_read("/w/main.rs");
        t.record_mutation("/w/main.rs");
        assert!(!t.is_redundant_read("/w/main.rs"), "file changed; a re-read is useful");
    }

    #[test]
    fn listing_is_cached_and_invalidated_by_child_mutation() {
        let mut t = FileOperationTracker::new();
        t.record_listing("/w/src", "main.rs\nlib.rs");
        assert_eq!(t.cached_listing("/w/src"), Some("main.rs\nlib.rs"));
        t.record_mutation("/w/src/new_file.rs");
        assert!(t.cached_listing("/w/src").is_none(), "parent listing changed");
    }

    #[test]
    fn files_read_keeps_first_read_order() {
        let mut t = FileOperationTracker::new();
        t.record_read("/a");
        t.record_read("/b");
        t.record_read("/a");
        assert_eq!(t.files_read(), &["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn tiny_html_write_is_refused_right_after_failed_fetch() {
        let mut t = FileOperationTracker::new();
        let now = Utc::now();
        t.record_web_fetch_failure(now);
        assert!(t.refuses_html_write("/w/page.html", "<html>stub</html>", now));
    }

    #[test]
    fn html_guard_expires_after_two_minutes() {
        let mut t = FileOperationTracker::new();
        let failed = Utc::now();
        t.record_web_fetch_failure(failed);
        let later = failed + ChronoDuration::minutes(3);
        assert!(!t.refuses_html_write("/w/page.html", "<html></html>", later));
    }

    #[test]
    fn large_html_and_non_html_writes_pass_the_guard() {
        let mut t = FileOperationTracker::new();
        let now = Utc::now();
        t.record_web_fetch_failure(now);
        let big = "x".repeat(TINY_HTML_BYTES + 1);
        assert!(!t.refuses_html_write("/w/page.html", &big, now));
        assert!(!t.refuses_html_write("/w/notes.md", "tiny", now));
    }

    #[test]
    fn no_guard_without_a_failed_fetch() {
        let t = FileOperationTracker::new();
        assert!(!t.refuses_html_write("/w/page.html", "tiny", Utc::now()));
    }

    #[test]
    fn tracker_state_round_trips_through_json() {
        let mut t = FileOperationTracker::new();
        t.record_read("/a");
        t.record_listing("/w", "a\nb");
        let json = serde_json::to_string(&t).unwrap();
        let back: FileOperationTracker = serde_json::from_str(&json).unwrap();
        assert!(back.is_redundant_read("/a"));
        assert_eq!(back.cached_listing("/w"), Some("a\nb"));
    }

    #[test]
    fn parent_dir_handles_root_and_nested() {
        assert_eq!(parent_dir("/w/src/main.rs").as_deref(), Some("/w/src"));
        assert_eq!(parent_dir("/top").as_deref(), Some("/"));
        assert_eq!(parent_dir("relative.txt"), None);
    }
}
