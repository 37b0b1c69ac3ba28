//! Shared mutable governor state.
//!
//! Each structure sits behind its own lock and every method holds at most
//! one lock at a time, for the shortest span that keeps the structure
//! consistent. The periodic sync task and command handlers both go through
//! here, so they can interleave freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::Config;
use crate::decision::{DecisionResult, DecisionSnapshot, GovernedStatus, HealthOverride};
use crate::ingest::LogRecord;
use crate::investigation::{
    Completion, InvestigationError, InvestigationSnapshot, InvestigationStateMachine,
};
use crate::issues::{
    Detection, Issue, IssueClassifier, IssueLedger, PendingIssuesFile, ResolveTarget, Severity,
};

/// Ledger counters for statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerStats {
    pub active: usize,
    pub total_detections: u64,
    pub by_severity: HashMap<Severity, usize>,
}

pub struct GovernorState {
    ledger: Mutex<IssueLedger>,
    investigation: Mutex<InvestigationStateMachine>,
    governed: RwLock<GovernedStatus>,
    classifier: IssueClassifier,
    pending: Option<PendingIssuesFile>,
    commands_processed: AtomicU64,
    started_at: DateTime<Utc>,
}

impl GovernorState {
    pub fn new(
        ledger: IssueLedger,
        investigation: InvestigationStateMachine,
        classifier: IssueClassifier,
        pending: Option<PendingIssuesFile>,
    ) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            investigation: Mutex::new(investigation),
            governed: RwLock::new(GovernedStatus::default()),
            classifier,
            pending,
            commands_processed: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Build from configuration, restoring pending issues if a file is set.
    pub async fn load(config: &Config) -> Self {
        let pending = config
            .memory
            .pending_issues_path
            .as_ref()
            .map(|path| PendingIssuesFile::new(path.clone()));
        let ledger = match &pending {
            Some(file) => file.load_ledger().await,
            None => IssueLedger::new(),
        };
        debug!(restored = ledger.len(), "Issue ledger ready");

        Self::new(
            ledger,
            InvestigationStateMachine::new(config.investigation.timeout_secs),
            IssueClassifier::default(),
            pending,
        )
    }

    pub fn classifier(&self) -> &IssueClassifier {
        &self.classifier
    }

    // ---- ledger ----

    pub async fn detect(&self, candidate: Issue) -> Detection {
        let mut ledger = self.ledger.lock().await;
        let detection = ledger.detect(candidate);
        self.persist(&ledger).await;
        detection
    }

    /// Feed a batch under one lock acquisition and one write.
    pub async fn detect_all(&self, candidates: Vec<Issue>) -> Vec<Detection> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut ledger = self.ledger.lock().await;
        let detections = candidates.into_iter().map(|c| ledger.detect(c)).collect();
        self.persist(&ledger).await;
        detections
    }

    /// Classify a record and, on a match, record it.
    pub async fn detect_record(&self, record: &LogRecord) -> Option<Detection> {
        let candidate = self.classifier.classify(record)?;
        Some(self.detect(candidate).await)
    }

    pub async fn resolve(&self, target: &ResolveTarget) -> Vec<Issue> {
        let mut ledger = self.ledger.lock().await;
        let removed = ledger.resolve(target);
        if !removed.is_empty() {
            self.persist(&ledger).await;
        }
        removed
    }

    pub async fn active_issues(&self) -> Vec<Issue> {
        self.ledger.lock().await.list_active()
    }

    /// Look up an active issue by id or fingerprint, then by type.
    pub async fn find_issue(&self, key: &str) -> Option<Issue> {
        let ledger = self.ledger.lock().await;
        ledger
            .get(key)
            .or_else(|| ledger.find_by_type(key))
            .cloned()
    }

    pub async fn ledger_stats(&self) -> LedgerStats {
        let ledger = self.ledger.lock().await;
        LedgerStats {
            active: ledger.len(),
            total_detections: ledger.total_detections(),
            by_severity: ledger.count_by_severity(),
        }
    }

    /// Rewrite the pending document while the ledger lock is held, so writes
    /// land in mutation order.
    async fn persist(&self, ledger: &IssueLedger) {
        if let Some(file) = &self.pending {
            if let Err(e) = file.save(&ledger.list_active()).await {
                warn!(path = %file.path().display(), error = %e, "Failed to persist pending issues");
            }
        }
    }

    // ---- governed process ----

    pub async fn governed(&self) -> GovernedStatus {
        self.governed.read().await.clone()
    }

    pub async fn set_governed(&self, status: GovernedStatus) {
        let mut current = self.governed.write().await;
        if current.paused != status.paused {
            debug!(paused = status.paused, "Governed process pause state changed");
        }
        *current = status;
    }

    // ---- investigation ----

    pub async fn investigation_status(&self) -> InvestigationSnapshot {
        self.investigation.lock().await.status_now()
    }

    pub async fn start_investigation(
        &self,
        decision: Option<DecisionResult>,
        timeout_secs: Option<u64>,
    ) -> Result<InvestigationSnapshot, InvestigationError> {
        self.investigation.lock().await.start(decision, timeout_secs)
    }

    pub async fn complete_investigation(&self) -> Completion {
        self.investigation.lock().await.complete()
    }

    pub async fn expire_investigation(&self, now: DateTime<Utc>) -> Option<Completion> {
        self.investigation.lock().await.expire_at(now)
    }

    // ---- decisions ----

    /// Copy everything a decision needs, one lock at a time.
    pub async fn decision_snapshot(&self, health: Option<&HealthOverride>) -> DecisionSnapshot {
        let active = self.active_issues().await;
        let investigation = self.investigation.lock().await.status();
        let recorded = self.governed().await;
        let governed = match health {
            Some(over) => over.apply(&recorded),
            None => recorded,
        };
        DecisionSnapshot::new(active, investigation, governed)
    }

    // ---- bookkeeping ----

    pub fn note_command(&self) -> u64 {
        self.commands_processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

impl Default for GovernorState {
    fn default() -> Self {
        Self::new(
            IssueLedger::new(),
            InvestigationStateMachine::default(),
            IssueClassifier::default(),
            None,
        )
    }
}
