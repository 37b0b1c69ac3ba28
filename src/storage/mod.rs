//! Durable fix-attempt history.
//!
//! Two interchangeable backends implement [`FixStore`]: a SQLite database
//! (the default) and a single JSON document. Both keep every attempt per
//! issue type in chronological order.

mod json;
mod sqlite;

pub use json::JsonFixStore;
pub use sqlite::SqliteFixStore;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{Config, FixStoreKind};
use crate::error::{StorageError, StorageResult};

/// Outcome of a single fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixOutcome {
    Success,
    Failure,
}

impl FixOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixOutcome::Success => "success",
            FixOutcome::Failure => "failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FixOutcome::Success)
    }
}

impl std::fmt::Display for FixOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FixOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" | "succeeded" | "true" | "ok" | "fixed" => Ok(FixOutcome::Success),
            "failure" | "failed" | "fail" | "false" | "error" => Ok(FixOutcome::Failure),
            _ => Err(format!(
                "Unknown fix result: {} (expected success or failure)",
                s
            )),
        }
    }
}

impl From<bool> for FixOutcome {
    fn from(success: bool) -> Self {
        if success {
            FixOutcome::Success
        } else {
            FixOutcome::Failure
        }
    }
}

/// One recorded remediation attempt. Never mutated after being written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    pub issue_type: String,
    pub fix_description: String,
    pub outcome: FixOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl FixAttempt {
    pub fn new(
        issue_type: impl Into<String>,
        fix_description: impl Into<String>,
        outcome: FixOutcome,
    ) -> Self {
        Self {
            issue_type: normalize_issue_type(&issue_type.into()),
            fix_description: fix_description.into(),
            outcome,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = if details.is_null() { None } else { Some(details) };
        self
    }
}

/// Per-issue-type attempt counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSummary {
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl FixSummary {
    pub fn from_attempts(attempts: &[FixAttempt]) -> Self {
        let success_count = attempts.iter().filter(|a| a.outcome.is_success()).count() as u64;
        Self {
            total_attempts: attempts.len() as u64,
            success_count,
            failure_count: attempts.len() as u64 - success_count,
        }
    }
}

/// A fix method that has failed at least once for an issue type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMethod {
    pub method: String,
    pub frequency: u64,
    pub last_attempt: DateTime<Utc>,
}

/// Storage backend for fix attempts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FixStore: Send + Sync {
    /// Append one attempt. Must be durable before returning.
    async fn append(&self, attempt: &FixAttempt) -> StorageResult<()>;

    /// All attempts for an issue type, oldest first.
    async fn history(&self, issue_type: &str) -> StorageResult<Vec<FixAttempt>>;

    /// Failed methods for an issue type, most frequent first.
    async fn failed_methods(&self, issue_type: &str) -> StorageResult<Vec<FailedMethod>>;

    /// Every issue type with at least one attempt.
    async fn issue_types(&self) -> StorageResult<Vec<String>>;

    /// Release backend resources.
    async fn close(&self);
}

/// Issue types are keyed case-insensitively.
pub fn normalize_issue_type(issue_type: &str) -> String {
    issue_type.trim().to_uppercase()
}

/// Key under which a fix description is aggregated as a failed method.
pub(crate) fn method_key(fix_description: &str) -> String {
    fix_description.trim().to_lowercase()
}

/// Group failed attempts by method, most frequent first.
pub(crate) fn aggregate_failures(attempts: &[FixAttempt]) -> Vec<FailedMethod> {
    let mut by_method: HashMap<String, FailedMethod> = HashMap::new();
    for attempt in attempts.iter().filter(|a| !a.outcome.is_success()) {
        let key = method_key(&attempt.fix_description);
        by_method
            .entry(key.clone())
            .and_modify(|m| {
                m.frequency += 1;
                m.last_attempt = m.last_attempt.max(attempt.timestamp);
            })
            .or_insert(FailedMethod {
                method: key,
                frequency: 1,
                last_attempt: attempt.timestamp,
            });
    }
    let mut methods: Vec<FailedMethod> = by_method.into_values().collect();
    methods.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then(b.last_attempt.cmp(&a.last_attempt))
            .then(a.method.cmp(&b.method))
    });
    methods
}

/// Open the backend selected by configuration.
pub async fn open_store(config: &Config) -> StorageResult<Arc<dyn FixStore>> {
    match config.memory.backend {
        FixStoreKind::Sqlite => {
            info!(path = %config.database.path.display(), "Opening SQLite fix memory");
            Ok(Arc::new(SqliteFixStore::new(&config.database).await?))
        }
        FixStoreKind::Json => {
            info!(path = %config.memory.json_path.display(), "Opening JSON fix memory");
            Ok(Arc::new(JsonFixStore::open(&config.memory.json_path).await?))
        }
    }
}

pub(crate) fn io_error(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Write JSON to a sibling temp file, then rename over the target.
pub(crate) async fn write_atomic(path: &Path, value: &Value) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(path, e))
}
