use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub monitor: MonitorConfig,
    pub gateway: GatewayConfig,
    pub investigation: InvestigationConfig,
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Which fix-memory backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixStoreKind {
    Sqlite,
    Json,
}

impl std::str::FromStr for FixStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sql" | "db" => Ok(FixStoreKind::Sqlite),
            "json" | "file" => Ok(FixStoreKind::Json),
            _ => Err(format!("Unknown fix memory backend: {}", s)),
        }
    }
}

/// Fix-attempt memory and pending-issue persistence
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub backend: FixStoreKind,
    pub json_path: PathBuf,
    pub pending_issues_path: Option<PathBuf>,
}

/// Periodic sync of status file and log files
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub status_file: Option<PathBuf>,
    pub log_files: Vec<PathBuf>,
    pub sync_interval_ms: u64,
}

/// Command gateway timeouts
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub command_timeout_ms: u64,
    pub init_timeout_ms: u64,
}

/// Investigation defaults
#[derive(Debug, Clone)]
pub struct InvestigationConfig {
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/governor.db".to_string()),
            ),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
        };

        let backend = match env::var("FIX_MEMORY_BACKEND") {
            Ok(raw) => raw
                .parse::<FixStoreKind>()
                .map_err(|message| AppError::Config { message })?,
            Err(_) => FixStoreKind::Sqlite,
        };

        let memory = MemoryConfig {
            backend,
            json_path: PathBuf::from(
                env::var("FIX_MEMORY_PATH")
                    .unwrap_or_else(|_| "./data/fix-memory.json".to_string()),
            ),
            pending_issues_path: Some(PathBuf::from(
                env::var("PENDING_ISSUES_PATH")
                    .unwrap_or_else(|_| "./data/pending-issues.json".to_string()),
            )),
        };

        let monitor = MonitorConfig {
            status_file: env::var("STATUS_FILE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            log_files: env::var("LOG_FILES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            sync_interval_ms: env_parse("SYNC_INTERVAL_MS", 1000),
        };

        let gateway = GatewayConfig {
            command_timeout_ms: env_parse("COMMAND_TIMEOUT_MS", 5000),
            init_timeout_ms: env_parse("INIT_TIMEOUT_MS", 30000),
        };

        let investigation = InvestigationConfig {
            timeout_secs: env_parse("INVESTIGATION_TIMEOUT_SECS", 900),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Config {
            database,
            memory,
            monitor,
            gateway,
            investigation,
            logging,
        })
    }

    /// In-memory configuration with no files on disk, used by tests and
    /// embedders that wire their own storage.
    pub fn ephemeral() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 1,
            },
            memory: MemoryConfig {
                backend: FixStoreKind::Sqlite,
                json_path: PathBuf::from("fix-memory.json"),
                pending_issues_path: None,
            },
            monitor: MonitorConfig::default(),
            gateway: GatewayConfig::default(),
            investigation: InvestigationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

impl MonitorConfig {
    /// Interval between sync ticks.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(10))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            status_file: None,
            log_files: Vec::new(),
            sync_interval_ms: 1000,
        }
    }
}

impl GatewayConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            init_timeout_ms: 30000,
        }
    }
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self { timeout_secs: 900 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_store_kind_parse() {
        assert_eq!("sqlite".parse::<FixStoreKind>().unwrap(), FixStoreKind::Sqlite);
        assert_eq!("JSON".parse::<FixStoreKind>().unwrap(), FixStoreKind::Json);
        assert!("redis".parse::<FixStoreKind>().is_err());
    }

    #[test]
    fn test_ephemeral_defaults() {
        let config = Config::ephemeral();
        assert_eq!(config.gateway.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.gateway.init_timeout(), Duration::from_secs(30));
        assert_eq!(config.investigation.timeout_secs, 900);
        assert!(config.memory.pending_issues_path.is_none());
        assert!(config.monitor.log_files.is_empty());
    }

    #[test]
    fn test_sync_interval_has_floor() {
        let monitor = MonitorConfig {
            sync_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(monitor.sync_interval(), Duration::from_millis(10));
    }
}
