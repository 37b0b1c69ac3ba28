use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    aggregate_failures, io_error, normalize_issue_type, write_atomic, FailedMethod, FixAttempt,
    FixOutcome, FixStore,
};
use crate::error::{StorageError, StorageResult};

/// Single-document fix memory:
///
/// ```json
/// {"POT_MISMATCH": {"attempts": [{"fixAttempt": "...", "success": false, "timestamp": "..."}],
///                   "successCount": 0, "failureCount": 1}}
/// ```
///
/// The whole document is rewritten atomically on every append.
pub struct JsonFixStore {
    path: PathBuf,
    document: Mutex<BTreeMap<String, IssueHistory>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueHistory {
    #[serde(default)]
    attempts: Vec<StoredAttempt>,
    #[serde(default)]
    success_count: u64,
    #[serde(default)]
    failure_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAttempt {
    fix_attempt: String,
    success: bool,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl StoredAttempt {
    fn into_attempt(self, issue_type: &str) -> FixAttempt {
        FixAttempt {
            issue_type: issue_type.to_string(),
            fix_description: self.fix_attempt,
            outcome: FixOutcome::from(self.success),
            timestamp: self.timestamp,
            details: self.details,
        }
    }
}

impl JsonFixStore {
    /// Open the document at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => parse_document(&raw).map_err(|e| StorageError::Serialization {
                message: format!("{}: {}", path.display(), e),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No fix memory document yet");
                BTreeMap::new()
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        info!(
            path = %path.display(),
            issue_types = document.len(),
            "Loaded JSON fix memory"
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse the document, re-keying issue types so differently-cased entries merge.
fn parse_document(raw: &str) -> Result<BTreeMap<String, IssueHistory>, serde_json::Error> {
    let loaded: BTreeMap<String, IssueHistory> = serde_json::from_str(raw)?;
    let mut document: BTreeMap<String, IssueHistory> = BTreeMap::new();
    for (issue_type, history) in loaded {
        let entry = document.entry(normalize_issue_type(&issue_type)).or_default();
        entry.attempts.extend(history.attempts);
    }
    for history in document.values_mut() {
        history.attempts.sort_by_key(|a| a.timestamp);
        history.success_count = history.attempts.iter().filter(|a| a.success).count() as u64;
        history.failure_count = history.attempts.len() as u64 - history.success_count;
    }
    Ok(document)
}

#[async_trait]
impl FixStore for JsonFixStore {
    async fn append(&self, attempt: &FixAttempt) -> StorageResult<()> {
        let mut document = self.document.lock().await;
        let key = normalize_issue_type(&attempt.issue_type);

        let mut updated = document.get(&key).cloned().unwrap_or_default();
        // Chronological, ties in arrival order.
        let at = updated
            .attempts
            .partition_point(|a| a.timestamp <= attempt.timestamp);
        updated.attempts.insert(at, StoredAttempt {
            fix_attempt: attempt.fix_description.clone(),
            success: attempt.outcome.is_success(),
            timestamp: attempt.timestamp,
            details: attempt.details.clone(),
        });
        if attempt.outcome.is_success() {
            updated.success_count += 1;
        } else {
            updated.failure_count += 1;
        }

        // Only commit to memory once the file write succeeded.
        let mut next = document.clone();
        next.insert(key, updated);
        let value = serde_json::to_value(&next).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &value).await?;
        *document = next;
        Ok(())
    }

    async fn history(&self, issue_type: &str) -> StorageResult<Vec<FixAttempt>> {
        let key = normalize_issue_type(issue_type);
        let document = self.document.lock().await;
        Ok(document
            .get(&key)
            .map(|h| {
                h.attempts
                    .iter()
                    .cloned()
                    .map(|a| a.into_attempt(&key))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn failed_methods(&self, issue_type: &str) -> StorageResult<Vec<FailedMethod>> {
        let attempts = self.history(issue_type).await?;
        Ok(aggregate_failures(&attempts))
    }

    async fn issue_types(&self) -> StorageResult<Vec<String>> {
        Ok(self.document.lock().await.keys().cloned().collect())
    }

    async fn close(&self) {
        debug!(path = %self.path.display(), "JSON fix memory closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_writes_document_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fix-memory.json");
        let store = JsonFixStore::open(&path).await.unwrap();

        store
            .append(&FixAttempt::new("POT_MISMATCH", "recalculate pot", FixOutcome::Failure))
            .await
            .unwrap();
        store
            .append(&FixAttempt::new("pot_mismatch", "reload hand", FixOutcome::Success))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        let entry = &doc["POT_MISMATCH"];
        assert_eq!(entry["successCount"], 1);
        assert_eq!(entry["failureCount"], 1);
        assert_eq!(entry["attempts"][0]["fixAttempt"], "recalculate pot");
        assert_eq!(entry["attempts"][0]["success"], false);
        assert_eq!(entry["attempts"][1]["success"], true);
    }

    #[tokio::test]
    async fn test_reopen_preserves_history_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fix-memory.json");
        let t0 = Utc::now();
        {
            let store = JsonFixStore::open(&path).await.unwrap();
            for i in 0..3 {
                store
                    .append(
                        &FixAttempt::new("STUCK_GAME", format!("attempt {}", i), FixOutcome::Failure)
                            .with_timestamp(t0 + Duration::seconds(i)),
                    )
                    .await
                    .unwrap();
            }
        }

        let reopened = JsonFixStore::open(&path).await.unwrap();
        let history = reopened.history("stuck_game").await.unwrap();
        let fixes: Vec<_> = history.iter().map(|a| a.fix_description.as_str()).collect();
        assert_eq!(fixes, vec!["attempt 0", "attempt 1", "attempt 2"]);
        assert_eq!(reopened.issue_types().await.unwrap(), vec!["STUCK_GAME"]);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fix-memory.json");
        tokio::fs::write(&path, "{broken").await.unwrap();
        assert!(matches!(
            JsonFixStore::open(&path).await,
            Err(StorageError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_has_empty_history() {
        let dir = tempdir().unwrap();
        let store = JsonFixStore::open(dir.path().join("m.json")).await.unwrap();
        assert!(store.history("NOPE").await.unwrap().is_empty());
        assert!(store.failed_methods("NOPE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backdated_append_lands_in_timestamp_order() {
        let dir = tempdir().unwrap();
        let store = JsonFixStore::open(dir.path().join("m.json")).await.unwrap();
        let t0 = Utc::now();

        for (fix, offset) in [("late", 20), ("early", 0), ("middle", 10)] {
            store
                .append(
                    &FixAttempt::new("POT_MISMATCH", fix, FixOutcome::Failure)
                        .with_timestamp(t0 + Duration::seconds(offset)),
                )
                .await
                .unwrap();
        }

        let history = store.history("POT_MISMATCH").await.unwrap();
        let fixes: Vec<_> = history.iter().map(|a| a.fix_description.as_str()).collect();
        assert_eq!(fixes, vec!["early", "middle", "late"]);
    }
}
