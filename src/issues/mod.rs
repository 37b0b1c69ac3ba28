//! Issue model: classification of log records and the deduplicating ledger.

mod classifier;
mod ledger;

pub use classifier::{rules, ClassificationRule, IssueClassifier, ManualIssue};
pub use ledger::{Detection, IssueLedger, PendingIssuesFile, ResolveTarget};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Critical and high issues qualify for pausing the governed process.
    pub fn is_qualifying(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Where an issue originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSource {
    Server,
    Unity,
    Database,
    Network,
    Log,
}

impl IssueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSource::Server => "server",
            IssueSource::Unity => "unity",
            IssueSource::Database => "database",
            IssueSource::Network => "network",
            IssueSource::Log => "log",
        }
    }
}

impl std::fmt::Display for IssueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IssueSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "server" => Ok(IssueSource::Server),
            "unity" => Ok(IssueSource::Unity),
            "database" | "db" => Ok(IssueSource::Database),
            "network" => Ok(IssueSource::Network),
            "log" => Ok(IssueSource::Log),
            _ => Err(format!("Unknown issue source: {}", s)),
        }
    }
}

/// How an issue was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Pattern,
    Manual,
    Ai,
}

/// Which fields make up an issue's identity in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintBasis {
    /// Pattern detections collapse on type and severity.
    TypeSeverity,
    /// Manual submissions collapse on type and source.
    TypeSource,
}

/// A classified issue, either a fresh candidate or a live ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub source: IssueSource,
    pub message: String,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_fixes: Option<Vec<String>>,
    #[serde(default = "default_basis")]
    pub fingerprint_basis: FingerprintBasis,
}

fn default_basis() -> FingerprintBasis {
    FingerprintBasis::TypeSeverity
}

impl Issue {
    /// Create a new candidate issue with `count = 1`.
    pub fn new(
        issue_type: impl Into<String>,
        severity: Severity,
        source: IssueSource,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("issue_{}", uuid::Uuid::new_v4()),
            issue_type: issue_type.into(),
            severity,
            source,
            message: message.into(),
            confidence: 0.5,
            method: DetectionMethod::Pattern,
            first_seen: now,
            last_seen: now,
            count: 1,
            root_cause: None,
            possible_fixes: None,
            fingerprint_basis: FingerprintBasis::TypeSeverity,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_method(mut self, method: DetectionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = Some(root_cause.into());
        self
    }

    pub fn with_fixes(mut self, fixes: Vec<String>) -> Self {
        self.possible_fixes = if fixes.is_empty() { None } else { Some(fixes) };
        self
    }

    pub fn with_basis(mut self, basis: FingerprintBasis) -> Self {
        self.fingerprint_basis = basis;
        self
    }

    /// Stable identity key. Depends only on the basis fields, never on the
    /// message, timestamps or id.
    pub fn fingerprint(&self) -> String {
        let issue_type = self.issue_type.trim().to_uppercase();
        match self.fingerprint_basis {
            FingerprintBasis::TypeSeverity => format!("{}:{}", issue_type, self.severity),
            FingerprintBasis::TypeSource => format!("{}@{}", issue_type, self.source),
        }
    }
}
