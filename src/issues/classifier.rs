//! Ordered, first-match-wins classification of log records.
//!
//! The rule table below is the reviewable artifact: rules are evaluated top to
//! bottom and the first rule whose level and keyword conditions hold decides
//! the issue type. Overlapping keywords are resolved purely by position, so a
//! line mentioning both "socket" and "timeout" is always a `NETWORK_TIMEOUT`.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{DetectionMethod, FingerprintBasis, Issue, IssueSource, Severity};
use crate::ingest::{parse_line, LogLevel, LogRecord};

/// A single classification rule.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub issue_type: &'static str,
    pub severity: Severity,
    pub source: IssueSource,
    /// Case-insensitive substrings; any one matching is enough. Empty means
    /// the rule matches on level alone.
    pub keywords: &'static [&'static str],
    pub min_level: Option<LogLevel>,
    pub confidence: f64,
    pub root_cause: &'static str,
    pub fixes: &'static [&'static str],
}

impl ClassificationRule {
    fn matches(&self, record: &LogRecord, lowered: &str) -> bool {
        if let Some(min) = self.min_level {
            match record.level {
                Some(level) if level.rank() >= min.rank() => {}
                _ => return false,
            }
        }
        self.keywords.is_empty() || self.keywords.iter().any(|k| lowered.contains(k))
    }

    fn to_issue(&self, record: &LogRecord) -> Issue {
        Issue::new(self.issue_type, self.severity, self.source, record.message.clone())
            .with_confidence(self.confidence)
            .with_method(DetectionMethod::Pattern)
            .with_root_cause(self.root_cause)
            .with_fixes(self.fixes.iter().map(|f| f.to_string()).collect())
            .with_basis(FingerprintBasis::TypeSeverity)
    }
}

static RULES: &[ClassificationRule] = &[
    ClassificationRule {
        issue_type: "CHIP_INTEGRITY",
        severity: Severity::Critical,
        source: IssueSource::Server,
        keywords: &["chip integrity", "chips created", "chips destroyed", "negative chip", "negative balance"],
        min_level: None,
        confidence: 0.9,
        root_cause: "Chip totals diverged from the ledger of buy-ins and cash-outs",
        fixes: &[
            "Recompute table chip totals from the hand history",
            "Lock the table and reconcile player balances",
        ],
    },
    ClassificationRule {
        issue_type: "POT_MISMATCH",
        severity: Severity::Critical,
        source: IssueSource::Server,
        keywords: &["pot mismatch", "pot total", "side pot", "pot calculation"],
        min_level: None,
        confidence: 0.9,
        root_cause: "Pot amount does not equal the sum of committed bets",
        fixes: &[
            "Clear pot at hand start",
            "Rebuild side pots from committed bets before showdown",
        ],
    },
    ClassificationRule {
        issue_type: "DUPLICATE_CARD",
        severity: Severity::Critical,
        source: IssueSource::Server,
        keywords: &["duplicate card", "card dealt twice", "deck corrupted"],
        min_level: None,
        confidence: 0.95,
        root_cause: "Deck state reused or shuffled incorrectly between hands",
        fixes: &["Reinitialize the deck at hand start", "Abort the hand and refund bets"],
    },
    ClassificationRule {
        issue_type: "DATABASE_ERROR",
        severity: Severity::High,
        source: IssueSource::Database,
        keywords: &["database", "sql", "deadlock", "connection pool", "query failed", "prisma"],
        min_level: None,
        confidence: 0.85,
        root_cause: "Database unavailable or a query failed",
        fixes: &["Restart the connection pool", "Retry the transaction with backoff"],
    },
    ClassificationRule {
        issue_type: "NETWORK_TIMEOUT",
        severity: Severity::High,
        source: IssueSource::Network,
        keywords: &["timeout", "timed out", "etimedout"],
        min_level: None,
        confidence: 0.8,
        root_cause: "A request or socket operation exceeded its deadline",
        fixes: &["Increase the socket timeout", "Check server load and event loop lag"],
    },
    ClassificationRule {
        issue_type: "SOCKET_DISCONNECT",
        severity: Severity::High,
        source: IssueSource::Network,
        keywords: &["socket", "disconnect", "econnreset", "connection reset", "websocket"],
        min_level: None,
        confidence: 0.75,
        root_cause: "Client connection dropped unexpectedly",
        fixes: &["Enable client reconnect with session resume", "Verify heartbeat interval"],
    },
    ClassificationRule {
        issue_type: "TURN_ORDER_VIOLATION",
        severity: Severity::High,
        source: IssueSource::Server,
        keywords: &["out of turn", "not your turn", "invalid action", "illegal action"],
        min_level: None,
        confidence: 0.8,
        root_cause: "Action accepted from a player who is not to act",
        fixes: &["Validate acting seat before applying actions", "Resync table state to clients"],
    },
    ClassificationRule {
        issue_type: "STUCK_GAME",
        severity: Severity::High,
        source: IssueSource::Server,
        keywords: &["stuck", "no progress", "hand not advancing", "game frozen"],
        min_level: None,
        confidence: 0.75,
        root_cause: "Game loop waiting on an action that will never arrive",
        fixes: &["Force-fold the idle seat after the action timer", "Restart the table loop"],
    },
    ClassificationRule {
        issue_type: "UNITY_CLIENT_ERROR",
        severity: Severity::Medium,
        source: IssueSource::Unity,
        keywords: &["unity", "nullreferenceexception", "missingreferenceexception"],
        min_level: None,
        confidence: 0.7,
        root_cause: "Client-side exception in the simulation",
        fixes: &["Reload the client scene", "Guard the failing component against missing state"],
    },
    ClassificationRule {
        issue_type: "AUTH_FAILURE",
        severity: Severity::Medium,
        source: IssueSource::Server,
        keywords: &["unauthorized", "auth failed", "invalid token", "jwt"],
        min_level: None,
        confidence: 0.7,
        root_cause: "Credentials rejected or expired",
        fixes: &["Refresh the session token", "Check clock skew between services"],
    },
    ClassificationRule {
        issue_type: "MEMORY_PRESSURE",
        severity: Severity::Medium,
        source: IssueSource::Server,
        keywords: &["out of memory", "heap", "memory leak"],
        min_level: None,
        confidence: 0.7,
        root_cause: "Process memory growing without bound",
        fixes: &["Capture a heap snapshot", "Restart the worker during a quiet period"],
    },
    ClassificationRule {
        issue_type: "SLOW_RESPONSE",
        severity: Severity::Low,
        source: IssueSource::Network,
        keywords: &["slow", "latency"],
        min_level: None,
        confidence: 0.6,
        root_cause: "Responses slower than expected",
        fixes: &["Profile the slow handler"],
    },
    ClassificationRule {
        issue_type: "UNHANDLED_EXCEPTION",
        severity: Severity::Medium,
        source: IssueSource::Log,
        keywords: &["unhandled", "exception", "panic", "stack trace"],
        min_level: None,
        confidence: 0.6,
        root_cause: "An error escaped its handler",
        fixes: &["Add error handling around the failing call"],
    },
    ClassificationRule {
        issue_type: "UNCLASSIFIED_ERROR",
        severity: Severity::Medium,
        source: IssueSource::Log,
        keywords: &[],
        min_level: Some(LogLevel::Error),
        confidence: 0.5,
        root_cause: "Error-level log line with no specific pattern",
        fixes: &[],
    },
];

/// The built-in rule table in evaluation order.
pub fn rules() -> &'static [ClassificationRule] {
    RULES
}

/// Maps log records and manual payloads to issue candidates.
///
/// Pure: never touches the ledger.
#[derive(Debug, Clone)]
pub struct IssueClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for IssueClassifier {
    fn default() -> Self {
        Self::new(RULES.to_vec())
    }
}

impl IssueClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify a record. Info and debug lines are never issues.
    pub fn classify(&self, record: &LogRecord) -> Option<Issue> {
        if matches!(record.level, Some(LogLevel::Info) | Some(LogLevel::Debug)) {
            return None;
        }

        let lowered = record.message.to_lowercase();
        let rule = self.rules.iter().find(|r| r.matches(record, &lowered))?;

        debug!(issue_type = rule.issue_type, source = %record.source, "Log record classified");
        Some(rule.to_issue(record))
    }

    /// Parse and classify a raw line; unparseable input is "no issue".
    pub fn classify_line(&self, line: &str, source: &str) -> Option<Issue> {
        parse_line(line, source).and_then(|r| self.classify(&r))
    }

    /// Look up the suggested fixes of the rule that produces `issue_type`.
    pub fn fixes_for(&self, issue_type: &str) -> Vec<String> {
        self.rules
            .iter()
            .find(|r| r.issue_type.eq_ignore_ascii_case(issue_type))
            .map(|r| r.fixes.iter().map(|f| f.to_string()).collect())
            .unwrap_or_default()
    }
}

/// An explicitly submitted issue. Trusted as given; no pattern matching.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub method: Option<DetectionMethod>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub possible_fixes: Option<Vec<String>>,
}

impl ManualIssue {
    /// Accepts either a JSON object or a string holding one.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let parsed: ManualIssue = match value {
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| e.to_string())?,
            Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string())?,
            other => return Err(format!("expected an issue object, got {}", other)),
        };
        if parsed.issue_type.trim().is_empty() {
            return Err("issue type must not be empty".to_string());
        }
        // Defaults cover absent fields only; a present value must be recognised.
        if let Some(severity) = &parsed.severity {
            severity.parse::<Severity>()?;
        }
        if let Some(source) = &parsed.source {
            source.parse::<IssueSource>()?;
        }
        Ok(parsed)
    }

    pub fn into_issue(self) -> Issue {
        let severity = self
            .severity
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Critical);
        let source = self
            .source
            .and_then(|s| s.parse().ok())
            .unwrap_or(IssueSource::Server);
        let message = self.message.unwrap_or_else(|| self.issue_type.clone());

        let mut issue = Issue::new(self.issue_type.trim(), severity, source, message)
            .with_confidence(self.confidence.unwrap_or(1.0))
            .with_method(self.method.unwrap_or(DetectionMethod::Manual))
            .with_basis(FingerprintBasis::TypeSource)
            .with_fixes(self.possible_fixes.unwrap_or_default());
        issue.root_cause = self.root_cause;
        issue
    }
}
