//! Pause/resume/investigate decisions.
//!
//! Everything here is a pure function of a [`DecisionSnapshot`]; callers take
//! the snapshot under their own locks and release them before deciding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::investigation::InvestigationStatus;
use crate::issues::{Issue, Severity};

/// Confidence reported when no single issue drives a decision.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl From<Severity> for Priority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Priority::High,
            Severity::High => Priority::Medium,
            Severity::Medium | Severity::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub should: bool,
    pub reason: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// Last known state of the governed process and its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernedStatus {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unity_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial status supplied with a single query; present fields win.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOverride {
    pub paused: Option<bool>,
    pub server_healthy: Option<bool>,
    pub database_healthy: Option<bool>,
    pub unity_connected: Option<bool>,
}

impl HealthOverride {
    /// Accepts an object or a JSON string holding one.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let parsed = match value {
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| format!("Invalid health object: {}", e))
    }

    pub fn apply(&self, status: &GovernedStatus) -> GovernedStatus {
        GovernedStatus {
            paused: self.paused.unwrap_or(status.paused),
            server_healthy: self.server_healthy.or(status.server_healthy),
            database_healthy: self.database_healthy.or(status.database_healthy),
            unity_connected: self.unity_connected.or(status.unity_connected),
            updated_at: status.updated_at,
        }
    }
}

impl GovernedStatus {
    /// Names of dependencies known to be unhealthy.
    pub fn unhealthy(&self) -> Vec<&'static str> {
        let mut down = Vec::new();
        if self.server_healthy == Some(false) {
            down.push("server");
        }
        if self.database_healthy == Some(false) {
            down.push("database");
        }
        if self.unity_connected == Some(false) {
            down.push("unity");
        }
        down
    }
}

/// Inputs for one round of decisions.
#[derive(Debug, Clone)]
pub struct DecisionSnapshot {
    pub active: Vec<Issue>,
    pub investigation: InvestigationStatus,
    pub governed: GovernedStatus,
}

impl DecisionSnapshot {
    pub fn new(
        active: Vec<Issue>,
        investigation: InvestigationStatus,
        governed: GovernedStatus,
    ) -> Self {
        Self {
            active,
            investigation,
            governed,
        }
    }

    fn qualifying(&self) -> Vec<&Issue> {
        self.active
            .iter()
            .filter(|i| i.severity.is_qualifying())
            .collect()
    }

    fn highest_severity(&self) -> Option<Severity> {
        self.active.iter().map(|i| i.severity).max()
    }

    /// Pause iff a qualifying issue is active and the process is not paused.
    pub fn should_pause_unity(&self) -> DecisionResult {
        let qualifying = self.qualifying();
        let confidence = confidence_of(&qualifying);

        if self.governed.paused {
            return DecisionResult {
                should: false,
                reason: "Unity is already paused".to_string(),
                confidence,
                priority: None,
            };
        }

        if qualifying.is_empty() {
            let reason = if self.active.is_empty() {
                "No active issues".to_string()
            } else {
                format!(
                    "{} active issue(s), none critical or high",
                    self.active.len()
                )
            };
            return DecisionResult {
                should: false,
                reason,
                confidence,
                priority: None,
            };
        }

        DecisionResult {
            should: true,
            reason: with_health_note(
                format!(
                    "{} critical/high issue(s) active: {}",
                    qualifying.len(),
                    describe(&qualifying)
                ),
                &self.governed,
            ),
            confidence,
            priority: self.highest_severity().map(Priority::from),
        }
    }

    /// Resume iff paused and the active list is empty.
    pub fn should_resume_unity(&self) -> DecisionResult {
        let all: Vec<&Issue> = self.active.iter().collect();
        let confidence = confidence_of(&all);

        if !self.governed.paused {
            return DecisionResult {
                should: false,
                reason: "Unity is not paused".to_string(),
                confidence,
                priority: None,
            };
        }

        if !self.active.is_empty() {
            return DecisionResult {
                should: false,
                reason: format!(
                    "{} issue(s) still pending: {}",
                    self.active.len(),
                    describe(&all)
                ),
                confidence,
                priority: None,
            };
        }

        DecisionResult {
            should: true,
            reason: with_health_note("All issues resolved".to_string(), &self.governed),
            confidence,
            priority: None,
        }
    }

    /// Start iff a qualifying issue is active and the investigation is idle.
    pub fn should_start_investigation(&self) -> DecisionResult {
        let qualifying = self.qualifying();
        let confidence = confidence_of(&qualifying);
        let priority = self.highest_severity().map(Priority::from);

        if self.investigation != InvestigationStatus::Idle {
            return DecisionResult {
                should: false,
                reason: format!("Investigation already {}", self.investigation),
                confidence,
                priority,
            };
        }

        if qualifying.is_empty() {
            return DecisionResult {
                should: false,
                reason: "No critical or high issues to investigate".to_string(),
                confidence,
                priority,
            };
        }

        DecisionResult {
            should: true,
            reason: format!("Investigate {}", describe(&qualifying)),
            confidence,
            priority,
        }
    }
}

fn confidence_of(contributing: &[&Issue]) -> f64 {
    match contributing {
        [single] => single.confidence,
        _ => NEUTRAL_CONFIDENCE,
    }
}

fn describe(issues: &[&Issue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} ({})", i.issue_type, i.severity))
        .collect::<Vec<_>>()
        .join(", ")
}

fn with_health_note(reason: String, status: &GovernedStatus) -> String {
    let down = status.unhealthy();
    if down.is_empty() {
        reason
    } else {
        format!("{}; unhealthy: {}", reason, down.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::IssueSource;
    use serde_json::json;

    fn issue(kind: &str, severity: Severity, confidence: f64) -> Issue {
        Issue::new(kind, severity, IssueSource::Server, "msg").with_confidence(confidence)
    }

    fn snapshot(active: Vec<Issue>, paused: bool) -> DecisionSnapshot {
        DecisionSnapshot::new(
            active,
            InvestigationStatus::Idle,
            GovernedStatus {
                paused,
                ..GovernedStatus::default()
            },
        )
    }

    #[test]
    fn test_pause_needs_qualifying_issue() {
        let d = snapshot(vec![issue("SLOW_RESPONSE", Severity::Medium, 0.6)], false)
            .should_pause_unity();
        assert!(!d.should);

        let d = snapshot(vec![issue("POT_MISMATCH", Severity::Critical, 0.9)], false)
            .should_pause_unity();
        assert!(d.should);
        assert_eq!(d.confidence, 0.9);
        assert_eq!(d.priority, Some(Priority::High));
        assert!(d.reason.contains("POT_MISMATCH"));
    }

    #[test]
    fn test_pause_not_repeated_when_paused() {
        let d = snapshot(vec![issue("POT_MISMATCH", Severity::Critical, 0.9)], true)
            .should_pause_unity();
        assert!(!d.should);
    }

    #[test]
    fn test_resume_hysteresis() {
        let d = snapshot(vec![issue("POT_MISMATCH", Severity::Critical, 0.9)], true)
            .should_resume_unity();
        assert!(!d.should);

        let d = snapshot(vec![issue("SLOW_RESPONSE", Severity::Low, 0.3)], true)
            .should_resume_unity();
        assert!(!d.should, "any pending issue blocks resume");

        let d = snapshot(vec![], true).should_resume_unity();
        assert!(d.should);

        let d = snapshot(vec![], false).should_resume_unity();
        assert!(!d.should);
    }

    #[test]
    fn test_multiple_issues_use_neutral_confidence() {
        let d = snapshot(
            vec![
                issue("POT_MISMATCH", Severity::Critical, 0.9),
                issue("STUCK_GAME", Severity::High, 0.8),
            ],
            false,
        )
        .should_pause_unity();
        assert_eq!(d.confidence, NEUTRAL_CONFIDENCE);
    }

    #[test]
    fn test_start_investigation_priority_tiers() {
        let d = snapshot(vec![issue("STUCK_GAME", Severity::High, 0.8)], false)
            .should_start_investigation();
        assert!(d.should);
        assert_eq!(d.priority, Some(Priority::Medium));

        let mut busy = snapshot(vec![issue("STUCK_GAME", Severity::High, 0.8)], false);
        busy.investigation = InvestigationStatus::Active;
        let d = busy.should_start_investigation();
        assert!(!d.should);
        assert!(d.reason.contains("active"));
    }

    #[test]
    fn test_health_override_applies_present_fields() {
        let base = GovernedStatus {
            paused: true,
            server_healthy: Some(true),
            ..GovernedStatus::default()
        };
        let over = HealthOverride::from_value(&json!({"serverHealthy": false})).unwrap();
        let merged = over.apply(&base);
        assert!(merged.paused);
        assert_eq!(merged.server_healthy, Some(false));
        assert_eq!(merged.unhealthy(), vec!["server"]);

        let from_string = HealthOverride::from_value(&json!("{\"paused\":false}")).unwrap();
        assert!(!from_string.apply(&base).paused);
        assert!(HealthOverride::from_value(&json!("nope")).is_err());
    }

    #[test]
    fn test_decision_serialization() {
        let d = snapshot(vec![], false).should_pause_unity();
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["should"], false);
        assert!(json.get("priority").is_none());
    }
}
