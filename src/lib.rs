//! # Remediation Governor
//!
//! Watches a live game backend's logs, turns lines into deduplicated issues,
//! decides whether the governed client should be paused or resumed, and
//! remembers which fixes were already tried so known-bad remedies are not
//! repeated.
//!
//! ## Architecture
//!
//! ```text
//! log files ──► ingest ──► issues (classifier → ledger) ──► decision
//!                                   │                          ▲
//!                                   ▼                          │
//!                           investigation  ◄── monitor (sync tick, status file)
//!
//! memory (fix attempts) ──► storage (SQLite | JSON)
//!
//! server: line-delimited JSON commands over stdin/stdout
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remediation_governor::{CommandGateway, Config, DefaultContextFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let gateway = CommandGateway::new(
//!         Arc::new(DefaultContextFactory::new(config.clone())),
//!         config.gateway.clone(),
//!     );
//!     gateway.run(tokio::io::stdin(), tokio::io::stdout()).await?;
//!     Ok(())
//! }
//! ```

/// Configuration management.
pub mod config;
/// Pause/resume/investigate decisions.
pub mod decision;
/// Error types and result aliases for the application.
pub mod error;
/// Log line parsing and file tailing.
pub mod ingest;
/// Investigation lifecycle state machine.
pub mod investigation;
/// Issue model, classification and the deduplicating ledger.
pub mod issues;
/// Fix-attempt memory and the check-before-fix verdict.
pub mod memory;
/// Periodic sync of status file, log tails and investigation timeout.
pub mod monitor;
/// Command gateway and request handling.
pub mod server;
/// Shared mutable state behind per-structure locks.
pub mod state;
/// Fix-attempt storage backends.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{CommandGateway, ContextFactory, DefaultContextFactory, GovernorContext};
