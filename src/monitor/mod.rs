//! Periodic sync: status file, log tails, investigation timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::decision::GovernedStatus;
use crate::ingest::LogTailer;
use crate::state::GovernorState;

/// What a single sync pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub status_updated: bool,
    pub records: usize,
    pub detections: usize,
    pub new_issues: usize,
    pub investigation_expired: bool,
}

/// Read the governed-process status document.
///
/// Missing, empty or malformed files yield `None`, leaving the recorded
/// status untouched.
pub async fn read_status_file(path: &Path) -> Option<GovernedStatus> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read status file");
            return None;
        }
    };
    if raw.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<GovernedStatus>(&raw) {
        Ok(mut status) => {
            status.updated_at.get_or_insert_with(Utc::now);
            Some(status)
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring malformed status file");
            None
        }
    }
}

pub struct SyncLoop {
    state: Arc<GovernorState>,
    tailer: LogTailer,
    status_file: Option<PathBuf>,
}

impl SyncLoop {
    /// Log files are followed from their current end.
    pub async fn new(state: Arc<GovernorState>, config: &MonitorConfig) -> Self {
        Self {
            state,
            tailer: LogTailer::from_end(&config.log_files).await,
            status_file: config.status_file.clone(),
        }
    }

    pub fn with_tailer(state: Arc<GovernorState>, tailer: LogTailer, status_file: Option<PathBuf>) -> Self {
        Self {
            state,
            tailer,
            status_file,
        }
    }

    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if let Some(path) = &self.status_file {
            if let Some(status) = read_status_file(path).await {
                self.state.set_governed(status).await;
                report.status_updated = true;
            }
        }

        if !self.tailer.is_empty() {
            let records = self.tailer.poll().await;
            report.records = records.len();
            let candidates: Vec<_> = records
                .iter()
                .filter_map(|r| self.state.classifier().classify(r))
                .collect();
            let detections = self.state.detect_all(candidates).await;
            report.detections = detections.len();
            report.new_issues = detections.iter().filter(|d| d.is_new).count();
        }

        if let Some(done) = self.state.expire_investigation(Utc::now()).await {
            info!(duration = ?done.duration_seconds, "Investigation timed out");
            report.investigation_expired = true;
        }

        if report.new_issues > 0 {
            info!(
                records = report.records,
                new_issues = report.new_issues,
                "Sync detected new issues"
            );
        }
        report
    }

    /// Run forever on a fixed interval. Abort the handle to stop.
    pub fn spawn(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigation::InvestigationStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_status_file_variants() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        assert!(read_status_file(&path).await.is_none());

        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(read_status_file(&path).await.is_none());

        tokio::fs::write(&path, r#"{"paused":true,"serverHealthy":false}"#)
            .await
            .unwrap();
        let status = read_status_file(&path).await.unwrap();
        assert!(status.paused);
        assert_eq!(status.server_healthy, Some(false));
        assert!(status.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_ingests_logs_and_status() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("server.log");
        let status = dir.path().join("status.json");
        tokio::fs::write(&log, "[ERROR] [GAME] pot mismatch on table 3\n[INFO] hand dealt\n")
            .await
            .unwrap();
        tokio::fs::write(&status, r#"{"paused":true}"#).await.unwrap();

        let state = Arc::new(GovernorState::default());
        let mut sync = SyncLoop::with_tailer(
            Arc::clone(&state),
            LogTailer::from_start(&[log.clone()]),
            Some(status),
        );

        let report = sync.tick().await;
        assert!(report.status_updated);
        assert_eq!(report.records, 2);
        assert_eq!(report.new_issues, 1);
        assert!(state.governed().await.paused);

        let report = sync.tick().await;
        assert_eq!(report.records, 0);
        assert_eq!(state.active_issues().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_expires_investigation() {
        let state = Arc::new(GovernorState::default());
        state.start_investigation(None, Some(1)).await.unwrap();

        let mut sync = SyncLoop::with_tailer(Arc::clone(&state), LogTailer::default(), None);
        assert!(!sync.tick().await.investigation_expired);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(sync.tick().await.investigation_expired);
        assert_eq!(
            state.investigation_status().await.status,
            InvestigationStatus::Idle
        );
    }
}
