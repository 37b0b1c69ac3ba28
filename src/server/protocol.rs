//! Line-delimited JSON wire format.
//!
//! Requests: `{"command": "...", "args": [...], "id": ...}`.
//! Responses: `{"id": ..., "result" | "error": ..., "timestamp": "..."}`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod protocol_tests;

/// One command request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub command: String,
    /// Positional arguments. A bare value is treated as a single argument.
    #[serde(default, deserialize_with = "args_list")]
    pub args: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

fn args_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Parse one line. On failure returns the id (if it could be recovered)
/// alongside the error, so the caller can still correlate.
pub fn parse_request(line: &str) -> Result<Request, (Value, GatewayError)> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        (
            Value::Null,
            GatewayError::Parse {
                message: e.to_string(),
            },
        )
    })?;

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = serde_json::from_value(value).map_err(|e| {
        (
            id,
            GatewayError::Parse {
                message: format!("Invalid request: {}", e),
            },
        )
    })?;

    if request.command.trim().is_empty() {
        return Err((
            request.id,
            GatewayError::Parse {
                message: "Missing command".to_string(),
            },
        ));
    }
    Ok(request)
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    #[serde(rename = "availableCommands", skip_serializing_if = "Option::is_none")]
    pub available_commands: Option<Vec<String>>,
}

/// One response line.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: String,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn failure(id: Value, error: &GatewayError) -> Self {
        let available_commands = match error {
            GatewayError::UnknownCommand { .. } => Some(
                super::AVAILABLE_COMMANDS
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
            _ => None,
        };
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                message: error.to_string(),
                code: error.code().to_string(),
                available_commands,
            }),
            timestamp: now_rfc3339(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// First line written once input handling is armed.
#[derive(Debug, Clone, Serialize)]
pub struct ReadySignal {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub pid: u32,
    pub timestamp: String,
}

impl ReadySignal {
    pub fn now() -> Self {
        Self {
            kind: "ready",
            pid: std::process::id(),
            timestamp: now_rfc3339(),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accumulates raw input and yields only complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every newline-terminated line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Bytes still waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
