use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Issue, Severity};
use crate::error::{StorageError, StorageResult};
use crate::storage::{io_error, write_atomic};

/// Outcome of feeding a candidate into the ledger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub issue: Issue,
    pub is_new: bool,
}

/// What to clear from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveTarget {
    One(String),
    All,
}

impl ResolveTarget {
    /// `"all"` (any case) clears everything, anything else names an issue.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("all") {
            ResolveTarget::All
        } else {
            ResolveTarget::One(raw.trim().to_string())
        }
    }
}

/// Deduplicating set of live issues, keyed by fingerprint.
#[derive(Debug, Default)]
pub struct IssueLedger {
    entries: HashMap<String, Issue>,
    total_detections: u64,
}

impl IssueLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted issues. Duplicate fingerprints are
    /// merged so the one-entry-per-fingerprint invariant holds on load.
    pub fn restore(issues: Vec<Issue>) -> Self {
        let mut ledger = Self::new();
        for issue in issues {
            let fp = issue.fingerprint();
            ledger.total_detections += issue.count;
            match ledger.entries.get_mut(&fp) {
                Some(existing) => {
                    existing.count += issue.count;
                    existing.first_seen = existing.first_seen.min(issue.first_seen);
                    existing.last_seen = existing.last_seen.max(issue.last_seen);
                }
                None => {
                    ledger.entries.insert(fp, issue);
                }
            }
        }
        ledger
    }

    /// Insert a candidate or bump the live entry with the same fingerprint.
    pub fn detect(&mut self, candidate: Issue) -> Detection {
        self.detect_at(candidate, Utc::now())
    }

    pub fn detect_at(&mut self, mut candidate: Issue, now: DateTime<Utc>) -> Detection {
        self.total_detections += 1;
        let fp = candidate.fingerprint();

        if let Some(existing) = self.entries.get_mut(&fp) {
            existing.count += 1;
            existing.last_seen = now;
            debug!(fingerprint = %fp, count = existing.count, "Repeat detection");
            return Detection {
                issue: existing.clone(),
                is_new: false,
            };
        }

        candidate.count = 1;
        candidate.first_seen = now;
        candidate.last_seen = now;
        info!(
            fingerprint = %fp,
            issue_id = %candidate.id,
            severity = %candidate.severity,
            "New issue detected"
        );
        self.entries.insert(fp, candidate.clone());
        Detection {
            issue: candidate,
            is_new: true,
        }
    }

    /// Look up a live issue by id, falling back to its fingerprint.
    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.entries
            .values()
            .find(|i| i.id == id)
            .or_else(|| self.entries.get(id))
    }

    /// Most recently seen live issue of the given type.
    pub fn find_by_type(&self, issue_type: &str) -> Option<&Issue> {
        self.entries
            .values()
            .filter(|i| i.issue_type.eq_ignore_ascii_case(issue_type))
            .max_by_key(|i| i.last_seen)
    }

    /// Live issues, most severe first, then most recent, then by fingerprint.
    pub fn list_active(&self) -> Vec<Issue> {
        let mut issues: Vec<(&String, &Issue)> = self.entries.iter().collect();
        issues.sort_by(|(fa, a), (fb, b)| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| fa.cmp(fb))
        });
        issues.into_iter().map(|(_, i)| i.clone()).collect()
    }

    /// Remove one issue or all of them, returning what was removed.
    pub fn resolve(&mut self, target: &ResolveTarget) -> Vec<Issue> {
        let removed: Vec<Issue> = match target {
            ResolveTarget::All => self.entries.drain().map(|(_, i)| i).collect(),
            ResolveTarget::One(id) => {
                let key = self
                    .entries
                    .iter()
                    .find(|(fp, i)| i.id == *id || *fp == id)
                    .map(|(fp, _)| fp.clone());
                key.and_then(|k| self.entries.remove(&k))
                    .into_iter()
                    .collect()
            }
        };
        if !removed.is_empty() {
            info!(resolved = removed.len(), remaining = self.entries.len(), "Issues resolved");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Detections seen since this ledger was built, repeats included.
    pub fn total_detections(&self) -> u64 {
        self.total_detections
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.entries.values().map(|i| i.severity).max()
    }

    pub fn count_by_severity(&self) -> HashMap<Severity, usize> {
        let mut counts = HashMap::new();
        for issue in self.entries.values() {
            *counts.entry(issue.severity).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PendingIssuesDocument {
    #[serde(default)]
    issues: Vec<Issue>,
}

/// `{"issues": [...]}` document holding the pending issue set on disk.
#[derive(Debug, Clone)]
pub struct PendingIssuesFile {
    path: PathBuf,
}

impl PendingIssuesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the pending set. A missing file is an empty set.
    pub async fn load(&self) -> StorageResult<Vec<Issue>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: PendingIssuesDocument =
            serde_json::from_str(&raw).map_err(|e| StorageError::Serialization {
                message: format!("{}: {}", self.path.display(), e),
            })?;
        Ok(doc.issues)
    }

    /// Atomically replace the document with `issues`.
    pub async fn save(&self, issues: &[Issue]) -> StorageResult<()> {
        let doc = serde_json::json!({ "issues": issues });
        write_atomic(&self.path, &doc).await
    }

    /// Load into a fresh ledger, starting empty if the file is unreadable.
    pub async fn load_ledger(&self) -> IssueLedger {
        match self.load().await {
            Ok(issues) => IssueLedger::restore(issues),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Pending issues unreadable, starting empty");
                IssueLedger::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::IssueSource;
    use chrono::Duration;
    use tempfile::tempdir;

    fn pot(message: &str) -> Issue {
        Issue::new("POT_MISMATCH", Severity::Critical, IssueSource::Server, message)
    }

    #[test]
    fn test_dedup_idempotence() {
        let mut ledger = IssueLedger::new();
        for i in 0..5 {
            let detection = ledger.detect(pot(&format!("pot off by {}", i)));
            assert_eq!(detection.is_new, i == 0);
        }

        let active = ledger.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].count, 5);
        assert_eq!(active[0].message, "pot off by 0");
        assert_eq!(ledger.total_detections(), 5);
    }

    #[test]
    fn test_repeat_keeps_id_and_first_seen() {
        let mut ledger = IssueLedger::new();
        let t0 = Utc::now();
        let first = ledger.detect_at(pot("a"), t0);
        let second = ledger.detect_at(pot("b"), t0 + Duration::seconds(30));

        assert_eq!(first.issue.id, second.issue.id);
        assert_eq!(second.issue.first_seen, t0);
        assert_eq!(second.issue.last_seen, t0 + Duration::seconds(30));
    }

    #[test]
    fn test_different_severity_is_different_issue() {
        let mut ledger = IssueLedger::new();
        ledger.detect(pot("a"));
        ledger.detect(Issue::new("POT_MISMATCH", Severity::High, IssueSource::Server, "b"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_list_active_sort_is_deterministic() {
        let mut ledger = IssueLedger::new();
        let now = Utc::now();
        ledger.detect_at(Issue::new("SLOW", Severity::Low, IssueSource::Network, "x"), now);
        ledger.detect_at(Issue::new("DB", Severity::High, IssueSource::Database, "x"), now);
        ledger.detect_at(pot("x"), now - Duration::seconds(5));
        ledger.detect_at(Issue::new("CHIPS", Severity::Critical, IssueSource::Server, "x"), now);

        let types: Vec<String> = ledger.list_active().into_iter().map(|i| i.issue_type).collect();
        assert_eq!(types, vec!["CHIPS", "POT_MISMATCH", "DB", "SLOW"]);
    }

    #[test]
    fn test_resolve_one_and_all() {
        let mut ledger = IssueLedger::new();
        let a = ledger.detect(pot("a")).issue;
        ledger.detect(Issue::new("DB", Severity::High, IssueSource::Database, "x"));

        let removed = ledger.resolve(&ResolveTarget::One(a.id.clone()));
        assert_eq!(removed.len(), 1);
        assert!(ledger.get(&a.id).is_none());
        assert_eq!(ledger.len(), 1);

        assert!(ledger.resolve(&ResolveTarget::One("missing".into())).is_empty());

        ledger.resolve(&ResolveTarget::All);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_resolve_target_parse() {
        assert_eq!(ResolveTarget::parse("ALL"), ResolveTarget::All);
        assert_eq!(ResolveTarget::parse(" issue_1 "), ResolveTarget::One("issue_1".into()));
    }

    #[test]
    fn test_restore_merges_duplicates() {
        let a = pot("a");
        let mut b = pot("b");
        b.count = 3;
        let ledger = IssueLedger::restore(vec![a, b]);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.list_active()[0].count, 4);
    }

    #[tokio::test]
    async fn test_pending_issues_round_trip() {
        let dir = tempdir().unwrap();
        let file = PendingIssuesFile::new(dir.path().join("nested/pending.json"));

        assert!(file.load().await.unwrap().is_empty());

        let mut ledger = IssueLedger::new();
        ledger.detect(pot("a"));
        ledger.detect(pot("a"));
        file.save(&ledger.list_active()).await.unwrap();

        let raw = tokio::fs::read_to_string(file.path()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["issues"].as_array().unwrap().len(), 1);

        let restored = file.load_ledger().await;
        assert_eq!(restored.list_active()[0].count, 2);
    }

    #[tokio::test]
    async fn test_corrupt_pending_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.json");
        tokio::fs::write(&path, "{ nope").await.unwrap();

        let file = PendingIssuesFile::new(&path);
        assert!(file.load().await.is_err());
        assert!(file.load_ledger().await.is_empty());
    }
}
