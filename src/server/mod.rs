//! Command gateway over a line-delimited JSON protocol.
//!
//! This module provides:
//! - The wire format and input line buffering
//! - Command routing and handlers
//! - The explicit [`GovernorContext`] and its lazy, single construction

mod gateway;
mod handlers;
mod protocol;

pub use gateway::{CommandGateway, StopReason};
pub use handlers::{handle_command, AVAILABLE_COMMANDS};
pub use protocol::{parse_request, ErrorBody, LineBuffer, ReadySignal, Request, Response};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::memory::FixAttemptMemory;
use crate::monitor::SyncLoop;
use crate::state::GovernorState;
use crate::storage::open_store;

/// Everything a command needs: shared state, fix memory and the sync task.
pub struct GovernorContext {
    state: Arc<GovernorState>,
    memory: FixAttemptMemory,
    sync_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GovernorContext {
    pub fn new(state: Arc<GovernorState>, memory: FixAttemptMemory) -> Self {
        Self {
            state,
            memory,
            sync_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_sync_task(self, handle: JoinHandle<()>) -> Self {
        if let Ok(mut slot) = self.sync_task.lock() {
            *slot = Some(handle);
        }
        self
    }

    pub fn state(&self) -> &Arc<GovernorState> {
        &self.state
    }

    pub fn memory(&self) -> &FixAttemptMemory {
        &self.memory
    }

    pub fn has_sync_task(&self) -> bool {
        self.sync_task
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Stop the sync task and close the fix memory. Safe to call twice.
    pub async fn shutdown(&self) {
        let handle = self.sync_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            info!("Sync task stopped");
        }
        self.memory.close().await;
    }
}

/// Shared context handle
pub type SharedContext = Arc<GovernorContext>;

/// Builds the context on first use.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn build(&self) -> AppResult<GovernorContext>;
}

/// Builds the context from [`Config`]: restores pending issues, opens the
/// configured fix store and starts the periodic sync task.
pub struct DefaultContextFactory {
    config: Config,
}

impl DefaultContextFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ContextFactory for DefaultContextFactory {
    async fn build(&self) -> AppResult<GovernorContext> {
        let state = Arc::new(GovernorState::load(&self.config).await);
        let store = open_store(&self.config).await?;
        let memory = FixAttemptMemory::new(store);

        let monitor = &self.config.monitor;
        let sync = SyncLoop::new(Arc::clone(&state), monitor).await;
        let handle = sync.spawn(monitor.sync_interval());

        info!(
            backend = ?self.config.memory.backend,
            log_files = monitor.log_files.len(),
            status_file = monitor.status_file.is_some(),
            "Governor context initialized"
        );

        Ok(GovernorContext::new(state, memory).with_sync_task(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_factory_builds_ephemeral_context() {
        let factory = DefaultContextFactory::new(Config::ephemeral());
        let context = factory.build().await.unwrap();
        assert!(context.has_sync_task());
        assert!(context.state().active_issues().await.is_empty());

        context.shutdown().await;
        assert!(!context.has_sync_task());
        context.shutdown().await;
    }
}
