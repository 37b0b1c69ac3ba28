//! Fix-attempt memory: records remediation outcomes and warns before a
//! known-bad fix is retried.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageResult;
use crate::storage::{
    normalize_issue_type, FailedMethod, FixAttempt, FixOutcome, FixStore, FixSummary,
};

/// Number of characters compared by the similarity heuristic.
const SIMILARITY_PREFIX: usize = 10;
/// Maximum attempts echoed back in a verdict.
const MAX_REPORTED: usize = 3;

/// How urgent a warning is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WarningSeverity {
    High,
    Medium,
}

/// Which branch of the check produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    NoHistory,
    ExactFailure,
    ExactSuccess,
    SimilarFailure,
    PriorSuccess,
    OnlyFailures,
}

/// Advisory answer to "should I try this fix?".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<WarningSeverity>,
    pub match_kind: MatchKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_attempt: Option<FixAttempt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub similar_failures: Vec<FixAttempt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub successful_fixes: Vec<FixAttempt>,
    pub summary: FixSummary,
}

impl Verdict {
    fn new(warning: bool, match_kind: MatchKind, message: String, summary: FixSummary) -> Self {
        Self {
            warning,
            severity: None,
            match_kind,
            message,
            recommendation: None,
            matched_attempt: None,
            similar_failures: Vec::new(),
            successful_fixes: Vec::new(),
            summary,
        }
    }

    fn severity(mut self, severity: WarningSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    fn recommend(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }
}

/// Totals across every issue type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTotals {
    pub issue_types: usize,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
}

/// Front end over a [`FixStore`] backend.
#[derive(Clone)]
pub struct FixAttemptMemory {
    store: Arc<dyn FixStore>,
}

impl FixAttemptMemory {
    pub fn new(store: Arc<dyn FixStore>) -> Self {
        Self { store }
    }

    /// Append an attempt and return the issue type's updated counts.
    pub async fn record(
        &self,
        issue_type: &str,
        fix_description: &str,
        outcome: FixOutcome,
        details: Option<Value>,
    ) -> StorageResult<FixSummary> {
        let mut attempt = FixAttempt::new(issue_type, fix_description, outcome);
        if let Some(details) = details {
            attempt = attempt.with_details(details);
        }
        self.store.append(&attempt).await?;

        let summary = self.summary(issue_type).await?;
        info!(
            issue_type = %attempt.issue_type,
            outcome = %outcome,
            total = summary.total_attempts,
            "Fix attempt recorded"
        );
        Ok(summary)
    }

    /// Evaluate a proposed fix against history. Advisory only.
    pub async fn check(&self, issue_type: &str, proposed_fix: &str) -> StorageResult<Verdict> {
        let history = self.store.history(issue_type).await?;
        let verdict = evaluate(&normalize_issue_type(issue_type), proposed_fix, &history);
        debug!(
            issue_type,
            warning = verdict.warning,
            kind = ?verdict.match_kind,
            "Fix check evaluated"
        );
        Ok(verdict)
    }

    pub async fn history(&self, issue_type: &str) -> StorageResult<Vec<FixAttempt>> {
        self.store.history(issue_type).await
    }

    pub async fn summary(&self, issue_type: &str) -> StorageResult<FixSummary> {
        let history = self.store.history(issue_type).await?;
        Ok(FixSummary::from_attempts(&history))
    }

    pub async fn failed_methods(&self, issue_type: &str) -> StorageResult<Vec<FailedMethod>> {
        self.store.failed_methods(issue_type).await
    }

    pub async fn issue_types(&self) -> StorageResult<Vec<String>> {
        self.store.issue_types().await
    }

    /// Aggregate counts over every issue type on record.
    pub async fn totals(&self) -> StorageResult<MemoryTotals> {
        let issue_types = self.issue_types().await?;
        let mut totals = MemoryTotals {
            issue_types: issue_types.len(),
            ..MemoryTotals::default()
        };
        for issue_type in &issue_types {
            let summary = self.summary(issue_type).await?;
            totals.total_attempts += summary.total_attempts;
            totals.success_count += summary.success_count;
            totals.failure_count += summary.failure_count;
        }
        if totals.total_attempts > 0 {
            totals.success_rate = totals.success_count as f64 / totals.total_attempts as f64;
        }
        Ok(totals)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn similarity_key(text: &str) -> String {
    text.trim().to_lowercase().chars().take(SIMILARITY_PREFIX).collect()
}

/// Prefix-containment heuristic over the first few characters.
fn is_similar(a: &str, b: &str) -> bool {
    let (a, b) = (similarity_key(a), similarity_key(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// Pure decision over a chronological history.
fn evaluate(issue_type: &str, proposed_fix: &str, history: &[FixAttempt]) -> Verdict {
    let summary = FixSummary::from_attempts(history);

    if history.is_empty() {
        return Verdict::new(
            false,
            MatchKind::NoHistory,
            format!("No previous attempts for {}, safe to try", issue_type),
            summary,
        );
    }

    let proposed = proposed_fix.trim().to_lowercase();

    // The most recent exact match decides.
    if let Some(exact) = history
        .iter()
        .rev()
        .find(|a| a.fix_description.trim().to_lowercase() == proposed)
    {
        let mut verdict = if exact.outcome.is_success() {
            Verdict::new(
                false,
                MatchKind::ExactSuccess,
                format!("This fix already succeeded before for {}", issue_type),
                summary,
            )
            .recommend("Reapply the known-good fix")
        } else {
            Verdict::new(
                true,
                MatchKind::ExactFailure,
                format!(
                    "This exact fix already failed for {} at {}",
                    issue_type,
                    exact.timestamp.to_rfc3339()
                ),
                summary,
            )
            .severity(WarningSeverity::High)
            .recommend("Try a different approach")
        };
        verdict.matched_attempt = Some(exact.clone());
        return verdict;
    }

    let similar: Vec<FixAttempt> = history
        .iter()
        .rev()
        .filter(|a| !a.outcome.is_success() && is_similar(&proposed, &a.fix_description))
        .take(MAX_REPORTED)
        .cloned()
        .collect();
    if !similar.is_empty() {
        let mut verdict = Verdict::new(
            true,
            MatchKind::SimilarFailure,
            format!("{} similar fix(es) already failed for {}", similar.len(), issue_type),
            summary,
        )
        .severity(WarningSeverity::Medium)
        .recommend("Be careful: similar approaches failed before");
        verdict.similar_failures = similar;
        return verdict;
    }

    let successes: Vec<FixAttempt> = history
        .iter()
        .rev()
        .filter(|a| a.outcome.is_success())
        .take(MAX_REPORTED)
        .cloned()
        .collect();
    if !successes.is_empty() {
        let mut verdict = Verdict::new(
            false,
            MatchKind::PriorSuccess,
            format!(
                "No similar failures; {} fix(es) worked before for {}",
                summary.success_count, issue_type
            ),
            summary,
        )
        .recommend("Consider a fix that worked before");
        verdict.successful_fixes = successes;
        return verdict;
    }

    Verdict::new(
        true,
        MatchKind::OnlyFailures,
        format!(
            "{} attempts failed, none succeeded for {}",
            summary.failure_count, issue_type
        ),
        summary,
    )
    .severity(WarningSeverity::High)
    .recommend("Escalate or investigate the root cause before another attempt")
}
