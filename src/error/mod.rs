use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Command gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Invalid arguments for {command}: {message}")]
    InvalidArguments { command: String, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Command {command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Stable wire code sent back to callers.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Parse { .. } => "PARSE_ERROR",
            GatewayError::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            GatewayError::InvalidArguments { .. } => "INVALID_ARGS",
            GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::ExecutionFailed { .. } => "COMMAND_FAILED",
            GatewayError::Storage(_) => "STORAGE_ERROR",
            GatewayError::Json(_) | GatewayError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn invalid(command: &str, message: impl Into<String>) -> Self {
        GatewayError::InvalidArguments {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

impl From<AppError> for GatewayError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Storage(e) => GatewayError::Storage(e),
            AppError::Gateway(e) => e,
            other => GatewayError::ExecutionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::Io {
            path: "/tmp/x.json".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "I/O error on /tmp/x.json: denied");

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_gateway_error_codes() {
        assert_eq!(
            GatewayError::Parse {
                message: "eof".to_string()
            }
            .code(),
            "PARSE_ERROR"
        );
        assert_eq!(
            GatewayError::UnknownCommand {
                command: "nope".to_string()
            }
            .code(),
            "UNKNOWN_COMMAND"
        );
        assert_eq!(GatewayError::invalid("query", "missing text").code(), "INVALID_ARGS");
        assert_eq!(
            GatewayError::Timeout {
                command: "ping".to_string(),
                timeout_ms: 5000
            }
            .code(),
            "TIMEOUT"
        );
        let storage: GatewayError = StorageError::Query {
            message: "locked".to_string(),
        }
        .into();
        assert_eq!(storage.code(), "STORAGE_ERROR");
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::invalid("detect-issue", "missing log line");
        assert_eq!(
            err.to_string(),
            "Invalid arguments for detect-issue: missing log line"
        );

        let err = GatewayError::Timeout {
            command: "get-status-report".to_string(),
            timeout_ms: 30000,
        };
        assert_eq!(
            err.to_string(),
            "Command get-status-report timed out after 30000ms"
        );
    }

    #[test]
    fn test_app_error_conversion_to_gateway_error() {
        let app_err = AppError::Config {
            message: "test error".to_string(),
        };
        let gw_err: GatewayError = app_err.into();
        assert!(matches!(gw_err, GatewayError::ExecutionFailed { .. }));
        assert!(gw_err.to_string().contains("Configuration error"));

        let app_err = AppError::Storage(StorageError::Query {
            message: "x".to_string(),
        });
        let gw_err: GatewayError = app_err.into();
        assert!(matches!(gw_err, GatewayError::Storage(_)));
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::Serialization {
            message: "bad".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }
}
