//! Investigation lifecycle: `idle → starting → active → completing → idle`.
//!
//! Time is always passed in explicitly (`*_at(now)`), so the progress math
//! is deterministic under test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::decision::DecisionResult;
use crate::issues::Issue;

/// Default investigation timeout (15 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigationStatus {
    Idle,
    Starting,
    Active,
    Completing,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStatus::Idle => "idle",
            InvestigationStatus::Starting => "starting",
            InvestigationStatus::Active => "active",
            InvestigationStatus::Completing => "completing",
        }
    }
}

impl std::fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum InvestigationError {
    #[error("Investigation already {status}")]
    AlreadyRunning { status: InvestigationStatus },
}

/// Point-in-time view of the investigation, with derived progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigationSnapshot {
    pub status: InvestigationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub elapsed_seconds: f64,
    pub progress: f64,
    pub time_remaining_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<DecisionResult>,
    pub completed_count: u64,
}

/// How a completion call found the machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub previous_status: InvestigationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub timed_out: bool,
}

#[derive(Debug)]
pub struct InvestigationStateMachine {
    status: InvestigationStatus,
    started_at: Option<DateTime<Utc>>,
    timeout_secs: u64,
    default_timeout_secs: u64,
    trigger: Option<DecisionResult>,
    completed_count: u64,
}

impl Default for InvestigationStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_SECS)
    }
}

impl InvestigationStateMachine {
    pub fn new(timeout_secs: u64) -> Self {
        let timeout_secs = timeout_secs.max(1);
        Self {
            status: InvestigationStatus::Idle,
            started_at: None,
            timeout_secs,
            default_timeout_secs: timeout_secs,
            trigger: None,
            completed_count: 0,
        }
    }

    pub fn status(&self) -> InvestigationStatus {
        self.status
    }

    pub fn is_idle(&self) -> bool {
        self.status == InvestigationStatus::Idle
    }

    /// Query only: a qualifying issue exists and nothing is running.
    pub fn should_start(&self, active: &[Issue]) -> bool {
        self.is_idle() && active.iter().any(|i| i.severity.is_qualifying())
    }

    pub fn start(
        &mut self,
        decision: Option<DecisionResult>,
        timeout_secs: Option<u64>,
    ) -> Result<InvestigationSnapshot, InvestigationError> {
        self.start_at(Utc::now(), decision, timeout_secs)
    }

    /// `idle → active`. The `starting` state is never observable from outside.
    pub fn start_at(
        &mut self,
        now: DateTime<Utc>,
        decision: Option<DecisionResult>,
        timeout_secs: Option<u64>,
    ) -> Result<InvestigationSnapshot, InvestigationError> {
        if !self.is_idle() {
            return Err(InvestigationError::AlreadyRunning {
                status: self.status,
            });
        }

        self.status = InvestigationStatus::Starting;
        self.started_at = Some(now);
        self.timeout_secs = timeout_secs.unwrap_or(self.default_timeout_secs).max(1);
        self.trigger = decision;
        self.status = InvestigationStatus::Active;

        info!(timeout_secs = self.timeout_secs, "Investigation started");
        Ok(self.status_at(now))
    }

    pub fn complete(&mut self) -> Completion {
        self.complete_at(Utc::now())
    }

    /// Back to `idle` from any state. Completing an idle machine is a no-op.
    pub fn complete_at(&mut self, now: DateTime<Utc>) -> Completion {
        self.finish(now, false)
    }

    /// Expire an active investigation whose timeout has elapsed.
    /// Returns the completion if one happened.
    pub fn expire_at(&mut self, now: DateTime<Utc>) -> Option<Completion> {
        if self.status != InvestigationStatus::Active {
            return None;
        }
        let started = self.started_at?;
        if elapsed_secs(started, now) < self.timeout_secs as f64 {
            return None;
        }
        Some(self.finish(now, true))
    }

    fn finish(&mut self, now: DateTime<Utc>, timed_out: bool) -> Completion {
        let previous_status = self.status;
        if previous_status == InvestigationStatus::Idle {
            debug!("Complete called while idle");
            return Completion {
                previous_status,
                duration_seconds: None,
                timed_out: false,
            };
        }

        self.status = InvestigationStatus::Completing;
        let duration_seconds = self.started_at.map(|s| elapsed_secs(s, now));
        self.started_at = None;
        self.trigger = None;
        self.timeout_secs = self.default_timeout_secs;
        self.completed_count += 1;
        self.status = InvestigationStatus::Idle;

        info!(?duration_seconds, timed_out, "Investigation completed");
        Completion {
            previous_status,
            duration_seconds,
            timed_out,
        }
    }

    pub fn status_now(&self) -> InvestigationSnapshot {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> InvestigationSnapshot {
        let timeout = self.timeout_secs as f64;
        let (elapsed, progress, remaining) = match self.started_at {
            Some(started) if self.status != InvestigationStatus::Idle => {
                let elapsed = elapsed_secs(started, now);
                (
                    elapsed,
                    (elapsed / timeout).min(1.0),
                    (timeout - elapsed).max(0.0),
                )
            }
            _ => (0.0, 0.0, 0.0),
        };

        InvestigationSnapshot {
            status: self.status,
            start_time: self.started_at,
            timeout_seconds: self.timeout_secs,
            elapsed_seconds: elapsed,
            progress,
            time_remaining_seconds: remaining,
            trigger: self.trigger.clone(),
            completed_count: self.completed_count,
        }
    }
}

fn elapsed_secs(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}
