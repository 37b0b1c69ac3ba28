use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{method_key, normalize_issue_type, FailedMethod, FixAttempt, FixOutcome, FixStore};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed fix memory.
///
/// Every attempt is a row in `fix_attempts`; failures are additionally
/// counted per normalized method in `failed_methods`.
#[derive(Clone)]
pub struct SqliteFixStore {
    pool: SqlitePool,
}

impl SqliteFixStore {
    /// Open (creating if needed) the database at `config.path`.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if config.path.as_os_str() == ":memory:" {
            return Self::new_in_memory().await;
        }

        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database, used by tests and ephemeral runs.
    pub async fn new_in_memory() -> StorageResult<Self> {
        // One long-lived connection: each sqlite in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        debug!("Running fix memory migrations");
        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;
        info!("Fix memory schema ready");
        Ok(())
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Query {
            message: format!("Invalid timestamp {:?}: {}", raw, e),
        })
}

#[async_trait]
impl FixStore for SqliteFixStore {
    async fn append(&self, attempt: &FixAttempt) -> StorageResult<()> {
        let issue_type = normalize_issue_type(&attempt.issue_type);
        let timestamp = format_ts(&attempt.timestamp);
        let details = attempt
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Serialization {
                message: e.to_string(),
            })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO fix_attempts (id, issue_type, fix_method, result, details, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&issue_type)
        .bind(&attempt.fix_description)
        .bind(attempt.outcome.as_str())
        .bind(&details)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

        if !attempt.outcome.is_success() {
            sqlx::query(
                r#"
                INSERT INTO failed_methods (issue_type, method, frequency, last_attempt)
                VALUES (?, ?, 1, ?)
                ON CONFLICT (issue_type, method) DO UPDATE SET
                    frequency = frequency + 1,
                    last_attempt = MAX(last_attempt, excluded.last_attempt)
                "#,
            )
            .bind(&issue_type)
            .bind(method_key(&attempt.fix_description))
            .bind(&timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, issue_type: &str) -> StorageResult<Vec<FixAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT issue_type, fix_method, result, details, timestamp
            FROM fix_attempts
            WHERE issue_type = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(normalize_issue_type(issue_type))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FixAttempt::try_from).collect()
    }

    async fn failed_methods(&self, issue_type: &str) -> StorageResult<Vec<FailedMethod>> {
        let rows: Vec<FailedMethodRow> = sqlx::query_as(
            r#"
            SELECT method, frequency, last_attempt
            FROM failed_methods
            WHERE issue_type = ?
            ORDER BY frequency DESC, last_attempt DESC, method ASC
            "#,
        )
        .bind(normalize_issue_type(issue_type))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(FailedMethod {
                    method: r.method,
                    frequency: r.frequency.max(0) as u64,
                    last_attempt: parse_ts(&r.last_attempt)?,
                })
            })
            .collect()
    }

    async fn issue_types(&self) -> StorageResult<Vec<String>> {
        let types: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT issue_type FROM fix_attempts ORDER BY issue_type")
                .fetch_all(&self.pool)
                .await?;
        Ok(types.into_iter().map(|(t,)| t).collect())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite fix memory closed");
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    issue_type: String,
    fix_method: String,
    result: String,
    details: Option<String>,
    timestamp: String,
}

impl TryFrom<AttemptRow> for FixAttempt {
    type Error = StorageError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let outcome = row
            .result
            .parse::<FixOutcome>()
            .map_err(|message| StorageError::Query { message })?;
        Ok(FixAttempt {
            issue_type: row.issue_type,
            fix_description: row.fix_method,
            outcome,
            timestamp: parse_ts(&row.timestamp)?,
            details: row.details.and_then(|d| serde_json::from_str(&d).ok()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct FailedMethodRow {
    method: String,
    frequency: i64,
    last_attempt: String,
}
