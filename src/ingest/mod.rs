//! Log ingestion: raw text lines into normalized [`LogRecord`]s.
//!
//! Three line shapes are understood:
//!
//! ```text
//! [2024-03-01T12:00:00.000Z] [ERROR] [GAME] Pot mismatch at table 4
//! 2024-03-01 12:00:00 WARN socket closed by peer
//! {"timestamp":"2024-03-01T12:00:00Z","level":"error","category":"db","message":"deadlock"}
//! ```
//!
//! Anything else is kept as a bare message. Lines emitted by the governor
//! itself are dropped so its own diagnostics never feed back into detection.

mod tail;

pub use tail::LogTailer;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categories the governor writes under; never classified.
const INTERNAL_CATEGORIES: &[&str] = &["MONITOR", "GOVERNOR", "DIAGNOSTIC"];
const INTERNAL_MARKER: &str = "[internal]";

static BRACKETED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?P<first>[^\]]+)\]\s*(?:\[(?P<second>[^\]]+)\]\s*)?(?:\[(?P<third>[^\]]+)\]\s*)?(?P<msg>.*)$")
        .expect("bracketed log pattern")
});

static PLAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<ts>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+(?P<level>[A-Za-z]+):?\s+(?:\[(?P<cat>[^\]]+)\]\s*)?(?P<msg>.*)$",
    )
    .expect("plain log pattern")
});

/// Normalized log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Rank used for "at least this level" comparisons.
    pub fn rank(&self) -> u8 {
        match self {
            LogLevel::Error => 3,
            LogLevel::Warn => 2,
            LogLevel::Info => 1,
            LogLevel::Debug => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ERROR" | "ERR" | "FATAL" | "CRITICAL" | "CRIT" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" | "NOTICE" => Ok(LogLevel::Info),
            "DEBUG" | "TRACE" | "VERBOSE" => Ok(LogLevel::Debug),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// A single normalized log line. Ephemeral: produced and consumed per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: Option<String>,
    pub level: Option<LogLevel>,
    pub category: Option<String>,
    pub message: String,
    pub source: String,
}

impl LogRecord {
    /// A record carrying only a message, as submitted directly by a caller.
    pub fn bare(message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            level: None,
            category: None,
            message: message.into(),
            source: source.into(),
        }
    }

    fn is_internal(&self) -> bool {
        if self.message.contains(INTERNAL_MARKER) {
            return true;
        }
        self.category
            .as_deref()
            .map(|c| INTERNAL_CATEGORIES.iter().any(|i| i.eq_ignore_ascii_case(c)))
            .unwrap_or(false)
    }
}

/// Parse one raw line. Returns `None` for blank lines and internal noise.
pub fn parse_line(line: &str, source: &str) -> Option<LogRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let record = if trimmed.starts_with('{') {
        parse_json(trimmed, source).unwrap_or_else(|| LogRecord::bare(trimmed, source))
    } else if let Some(rec) = parse_bracketed(trimmed, source) {
        rec
    } else if let Some(rec) = parse_plain(trimmed, source) {
        rec
    } else {
        LogRecord::bare(trimmed, source)
    };

    if record.message.is_empty() || record.is_internal() {
        return None;
    }

    Some(record)
}

fn parse_bracketed(line: &str, source: &str) -> Option<LogRecord> {
    let caps = BRACKETED.captures(line)?;
    let groups: Vec<&str> = ["first", "second", "third"]
        .iter()
        .filter_map(|name| caps.name(name).map(|m| m.as_str()))
        .collect();
    let message = caps.name("msg").map(|m| m.as_str().trim()).unwrap_or("");

    // Locate the level bracket; a timestamp may precede it and a category follow it.
    let level_pos = groups.iter().position(|g| g.parse::<LogLevel>().is_ok())?;
    if level_pos > 1 {
        return None;
    }

    let timestamp = if level_pos == 1 {
        Some(groups[0].trim().to_string())
    } else {
        None
    };
    let level = groups[level_pos].parse::<LogLevel>().ok();

    // Brackets after the level: the first is the category, any extra is message text.
    let rest = &groups[level_pos + 1..];
    let category = rest.first().map(|c| c.trim().to_string());
    let message = if rest.len() > 1 {
        format!("[{}] {}", rest[1..].join("] ["), message)
            .trim()
            .to_string()
    } else {
        message.to_string()
    };

    Some(LogRecord {
        timestamp,
        level,
        category,
        message,
        source: source.to_string(),
    })
}

fn parse_plain(line: &str, source: &str) -> Option<LogRecord> {
    let caps = PLAIN.captures(line)?;
    let level = caps.name("level")?.as_str().parse::<LogLevel>().ok()?;

    Some(LogRecord {
        timestamp: caps.name("ts").map(|m| m.as_str().to_string()),
        level: Some(level),
        category: caps.name("cat").map(|m| m.as_str().trim().to_string()),
        message: caps
            .name("msg")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        source: source.to_string(),
    })
}

fn parse_json(line: &str, source: &str) -> Option<LogRecord> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
    };

    let message = text(&["message", "msg", "error"])?;

    Some(LogRecord {
        timestamp: text(&["timestamp", "time", "ts"]),
        level: text(&["level", "severity"]).and_then(|l| l.parse().ok()),
        category: text(&["category", "module", "component"]),
        message,
        source: source.to_string(),
    })
}
