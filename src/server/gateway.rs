use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use super::handlers::{handle_command, is_known_command, ping_result};
use super::protocol::{parse_request, LineBuffer, ReadySignal, Request, Response};
use super::{ContextFactory, SharedContext};
use crate::config::GatewayConfig;
use crate::error::{AppResult, GatewayError};

const READ_CHUNK: usize = 8 * 1024;

/// Why [`CommandGateway::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    EndOfInput,
}

/// Single front door for every command.
///
/// The context is built on the first command that needs it. Concurrent
/// first callers all await the same in-flight construction.
#[derive(Clone)]
pub struct CommandGateway {
    factory: Arc<dyn ContextFactory>,
    context: Arc<OnceCell<SharedContext>>,
    config: GatewayConfig,
}

impl CommandGateway {
    pub fn new(factory: Arc<dyn ContextFactory>, config: GatewayConfig) -> Self {
        Self {
            factory,
            context: Arc::new(OnceCell::new()),
            config,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.context.initialized()
    }

    /// Get the context, building it if this is the first use. A failed
    /// build is not cached; the next caller retries.
    pub async fn context(&self) -> AppResult<SharedContext> {
        let factory = Arc::clone(&self.factory);
        self.context
            .get_or_try_init(|| async move {
                info!("Initializing governor context");
                factory.build().await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Run one request to completion with its error boundary and timeout.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id.clone();
        let command = request.command.clone();

        if command == "ping" {
            return Response::success(id, ping_result(self.is_initialized()));
        }
        if !is_known_command(&command) {
            warn!(command = %command, "Unknown command");
            return Response::failure(id, &GatewayError::UnknownCommand { command });
        }

        // A cold gateway pays for initialization inside this command.
        let limit = if self.is_initialized() {
            self.config.command_timeout()
        } else {
            self.config.init_timeout()
        };

        let gateway = self.clone();
        let task = tokio::spawn(async move { gateway.execute(request).await });

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(join_error)) => {
                error!(command = %command, error = %join_error, "Command handler panicked");
                Response::failure(
                    id,
                    &GatewayError::Internal {
                        message: format!("{} failed unexpectedly", command),
                    },
                )
            }
            Err(_) => {
                // The task keeps running; its outcome is unknown to the caller.
                warn!(command = %command, timeout_ms = limit.as_millis() as u64, "Command timed out");
                Response::failure(
                    id,
                    &GatewayError::Timeout {
                        command,
                        timeout_ms: limit.as_millis() as u64,
                    },
                )
            }
        }
    }

    async fn execute(&self, request: Request) -> Response {
        let ctx = match self.context().await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "Governor context failed to initialize");
                return Response::failure(request.id, &GatewayError::from(e));
            }
        };
        ctx.state().note_command();

        match handle_command(&ctx, &request.command, &request.args).await {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                warn!(command = %request.command, code = e.code(), error = %e, "Command failed");
                Response::failure(request.id, &e)
            }
        }
    }

    /// Serve the line protocol until `shutdown` or end of input, then
    /// release the context.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> std::io::Result<StopReason>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(writer, rx));

        send(&tx, &ReadySignal::now());
        info!("Gateway ready");

        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        let reason = 'read: loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break 'read StopReason::EndOfInput,
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Input read failed");
                    break 'read StopReason::EndOfInput;
                }
            };

            for line in buffer.push(&chunk[..n]) {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(request = %line, "Received request");

                let request = match parse_request(&line) {
                    Ok(request) => request,
                    Err((id, e)) => {
                        warn!(error = %e, "Rejected malformed request");
                        send(&tx, &Response::failure(id, &e));
                        continue;
                    }
                };

                match request.command.as_str() {
                    "shutdown" => {
                        send(&tx, &Response::success(request.id, json!({ "shuttingDown": true })));
                        break 'read StopReason::Shutdown;
                    }
                    "ping" => {
                        send(&tx, &Response::success(request.id, ping_result(self.is_initialized())));
                    }
                    _ => {
                        let gateway = self.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let response = gateway.dispatch(request).await;
                            send(&tx, &response);
                        });
                    }
                }
            }
        };

        if buffer.pending_len() > 0 {
            debug!(bytes = buffer.pending_len(), "Discarding unterminated input");
        }
        info!(?reason, "Gateway stopping");

        // The writer finishes once every in-flight command has answered.
        drop(tx);
        match writer_task.await {
            Ok(Err(e)) => warn!(error = %e, "Output write failed"),
            Err(e) => warn!(error = %e, "Writer task failed"),
            Ok(Ok(())) => {}
        }

        self.shutdown().await;
        Ok(reason)
    }

    /// Release the context if it was ever built.
    pub async fn shutdown(&self) {
        if let Some(ctx) = self.context.get() {
            ctx.shutdown().await;
            info!("Governor context released");
        }
    }
}

fn send<T: Serialize>(tx: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if tx.send(line).is_err() {
                debug!("Output closed, dropping response");
            }
        }
        Err(e) => error!(error = %e, "Failed to serialize response"),
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::memory::FixAttemptMemory;
    use crate::server::GovernorContext;
    use crate::state::GovernorState;
    use crate::storage::SqliteFixStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowFactory {
        delay: Duration,
    }

    #[async_trait]
    impl ContextFactory for SlowFactory {
        async fn build(&self) -> AppResult<GovernorContext> {
            tokio::time::sleep(self.delay).await;
            let store = SqliteFixStore::new_in_memory().await?;
            Ok(GovernorContext::new(
                Arc::new(GovernorState::default()),
                FixAttemptMemory::new(Arc::new(store)),
            ))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ContextFactory for FailingFactory {
        async fn build(&self) -> AppResult<GovernorContext> {
            Err(AppError::Config {
                message: "no database".to_string(),
            })
        }
    }

    struct PanickingFactory;

    #[async_trait]
    impl ContextFactory for PanickingFactory {
        async fn build(&self) -> AppResult<GovernorContext> {
            panic!("context construction blew up");
        }
    }

    fn request(command: &str) -> Request {
        Request {
            command: command.to_string(),
            args: Vec::new(),
            id: json!(1),
        }
    }

    fn gateway(factory: Arc<dyn ContextFactory>, command_ms: u64, init_ms: u64) -> CommandGateway {
        CommandGateway::new(
            factory,
            GatewayConfig {
                command_timeout_ms: command_ms,
                init_timeout_ms: init_ms,
            },
        )
    }

    #[tokio::test]
    async fn test_ping_does_not_initialize() {
        let gw = gateway(Arc::new(FailingFactory), 100, 100);
        let response = gw.dispatch(request("ping")).await;
        assert_eq!(response.result.unwrap()["initialized"], false);
        assert!(!gw.is_initialized());
    }

    #[tokio::test]
    async fn test_init_failure_is_reported_and_retried() {
        let gw = gateway(Arc::new(FailingFactory), 100, 100);
        let response = gw.dispatch(request("get-active-issues")).await;
        assert_eq!(response.error.unwrap().code, "COMMAND_FAILED");
        assert!(!gw.is_initialized());
    }

    #[tokio::test]
    async fn test_slow_init_times_out() {
        let gw = gateway(
            Arc::new(SlowFactory {
                delay: Duration::from_millis(300),
            }),
            1000,
            50,
        );
        let response = gw.dispatch(request("get-active-issues")).await;
        assert_eq!(response.error.unwrap().code, "TIMEOUT");

        // The detached build still completes.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(gw.is_initialized());
        let response = gw.dispatch(request("get-active-issues")).await;
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_unknown_command_skips_init() {
        let gw = gateway(Arc::new(FailingFactory), 100, 100);
        let response = gw.dispatch(request("dance")).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "UNKNOWN_COMMAND");
        assert!(error.available_commands.unwrap().len() > 10);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error_and_gateway_survives() {
        let gw = gateway(Arc::new(PanickingFactory), 1000, 1000);
        let response = gw.dispatch(request("get-active-issues")).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "INTERNAL_ERROR");
        assert!(error.message.contains("get-active-issues"));
        assert!(!gw.is_initialized());

        let response = gw.dispatch(request("ping")).await;
        assert!(!response.is_error());
        assert_eq!(response.result.unwrap()["pong"], true);
    }
}
