//! End-to-end tests of the line protocol over an in-memory duplex pipe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use remediation_governor::config::{Config, GatewayConfig};
use remediation_governor::memory::FixAttemptMemory;
use remediation_governor::server::{
    CommandGateway, ContextFactory, DefaultContextFactory, GovernorContext, StopReason,
};
use remediation_governor::state::GovernorState;
use remediation_governor::storage::SqliteFixStore;
use remediation_governor::AppResult;

/// Counts builds and takes a moment to finish each one.
struct CountingFactory {
    builds: Arc<AtomicUsize>,
}

#[async_trait]
impl ContextFactory for CountingFactory {
    async fn build(&self) -> AppResult<GovernorContext> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let store = SqliteFixStore::new_in_memory().await?;
        Ok(GovernorContext::new(
            Arc::new(GovernorState::default()),
            FixAttemptMemory::new(Arc::new(store)),
        ))
    }
}

/// Construction panics every time.
struct PanickingFactory;

#[async_trait]
impl ContextFactory for PanickingFactory {
    async fn build(&self) -> AppResult<GovernorContext> {
        panic!("storage driver crashed");
    }
}

struct Harness {
    input: WriteHalf<DuplexStream>,
    output: Lines<BufReader<ReadHalf<DuplexStream>>>,
    server: JoinHandle<std::io::Result<StopReason>>,
}

impl Harness {
    fn start(gateway: CommandGateway) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let server = tokio::spawn(async move { gateway.run(server_read, server_write).await });
        Self {
            input: client_write,
            output: BufReader::new(client_read).lines(),
            server,
        }
    }

    async fn send_raw(&mut self, raw: &str) {
        self.input.write_all(raw.as_bytes()).await.unwrap();
        self.input.flush().await.unwrap();
    }

    async fn send(&mut self, request: Value) {
        self.send_raw(&format!("{}\n", request)).await;
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
            .await
            .expect("response within 5s")
            .unwrap()
            .expect("output still open");
        serde_json::from_str(&line).unwrap()
    }

    /// Collect `n` responses keyed by id, in whatever order they arrive.
    async fn recv_by_id(&mut self, n: usize) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let response = self.recv().await;
            out.push((response["id"].clone(), response));
        }
        out
    }
}

fn ephemeral_gateway() -> CommandGateway {
    let config = Config::ephemeral();
    CommandGateway::new(
        Arc::new(DefaultContextFactory::new(config.clone())),
        config.gateway,
    )
}

#[tokio::test]
async fn test_ready_line_comes_first() {
    let mut harness = Harness::start(ephemeral_gateway());
    let ready = harness.recv().await;
    assert_eq!(ready["type"], "ready");
    assert!(ready["pid"].is_u64());
    assert!(ready["timestamp"].is_string());
}

#[tokio::test]
async fn test_ping_on_cold_gateway() {
    let gateway = ephemeral_gateway();
    let mut harness = Harness::start(gateway.clone());
    harness.recv().await;

    harness.send(json!({"command": "ping", "id": 1})).await;
    let response = harness.recv().await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["pong"], true);
    assert_eq!(response["result"]["initialized"], false);
    assert!(!gateway.is_initialized());
}

#[tokio::test]
async fn test_malformed_line_does_not_block_following_commands() {
    let mut harness = Harness::start(ephemeral_gateway());
    harness.recv().await;

    harness
        .send_raw("{not json\n{\"command\":\"get-active-issues\",\"id\":\"after\"}\n")
        .await;

    let first = harness.recv().await;
    assert_eq!(first["error"]["code"], "PARSE_ERROR");
    assert_eq!(first["id"], Value::Null);

    let second = harness.recv().await;
    assert_eq!(second["id"], "after");
    assert_eq!(second["result"]["count"], 0);
}

#[tokio::test]
async fn test_unknown_command_lists_commands() {
    let gateway = ephemeral_gateway();
    let mut harness = Harness::start(gateway.clone());
    harness.recv().await;

    harness.send(json!({"command": "deal-cards", "id": 7})).await;
    let response = harness.recv().await;
    assert_eq!(response["error"]["code"], "UNKNOWN_COMMAND");
    let commands = response["error"]["availableCommands"].as_array().unwrap();
    assert!(commands.iter().any(|c| c == "should-pause-unity"));
    assert!(!gateway.is_initialized());
}

#[tokio::test]
async fn test_request_split_across_writes() {
    let mut harness = Harness::start(ephemeral_gateway());
    harness.recv().await;

    harness.send_raw("{\"command\":\"pi").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.send_raw("ng\",\"id\":42}\n").await;

    let response = harness.recv().await;
    assert_eq!(response["id"], 42);
    assert_eq!(response["result"]["pong"], true);
}

#[tokio::test]
async fn test_shutdown_stops_the_loop() {
    let mut harness = Harness::start(ephemeral_gateway());
    harness.recv().await;

    harness.send(json!({"command": "shutdown", "id": "bye"})).await;
    let response = harness.recv().await;
    assert_eq!(response["result"]["shuttingDown"], true);

    let reason = harness.server.await.unwrap().unwrap();
    assert_eq!(reason, StopReason::Shutdown);
}

#[tokio::test]
async fn test_end_of_input_stops_the_loop() {
    let mut harness = Harness::start(ephemeral_gateway());
    harness.recv().await;

    harness.input.shutdown().await.unwrap();
    let reason = harness.server.await.unwrap().unwrap();
    assert_eq!(reason, StopReason::EndOfInput);
}

#[tokio::test]
async fn test_concurrent_first_commands_build_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    let gateway = CommandGateway::new(
        Arc::new(CountingFactory {
            builds: Arc::clone(&builds),
        }),
        GatewayConfig::default(),
    );
    let mut harness = Harness::start(gateway.clone());
    harness.recv().await;

    for id in 0..8 {
        harness
            .send(json!({"command": "get-active-issues", "id": id}))
            .await;
    }
    let responses = harness.recv_by_id(8).await;
    assert!(responses.iter().all(|(_, r)| r["error"].is_null()));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(gateway.is_initialized());
}

#[tokio::test]
async fn test_detect_then_decide_over_the_wire() {
    let mut harness = Harness::start(ephemeral_gateway());
    harness.recv().await;

    harness
        .send(json!({
            "command": "detect-issue",
            "args": ["[ERROR] [GAME] pot mismatch on table 4: 120 != 100"],
            "id": 1
        }))
        .await;
    let detected = harness.recv().await;
    assert_eq!(detected["result"]["detected"], true);
    assert_eq!(detected["result"]["issue"]["type"], "POT_MISMATCH");

    harness
        .send(json!({"command": "should-pause-unity", "id": 2}))
        .await;
    let pause = harness.recv().await;
    assert_eq!(pause["result"]["should"], true);
    assert_eq!(pause["result"]["priority"], "high");

    // Known-paused process per query; the recorded state stays unpaused.
    harness
        .send(json!({"command": "should-pause-unity", "args": [{"paused": true}], "id": 3}))
        .await;
    let paused = harness.recv().await;
    assert_eq!(paused["result"]["should"], false);
}

#[tokio::test]
async fn test_panicking_command_answers_and_wire_stays_open() {
    let gateway = CommandGateway::new(Arc::new(PanickingFactory), GatewayConfig::default());
    let mut harness = Harness::start(gateway);
    harness.recv().await;

    harness
        .send(json!({"command": "get-active-issues", "id": "boom"}))
        .await;
    let failed = harness.recv().await;
    assert_eq!(failed["id"], "boom");
    assert_eq!(failed["error"]["code"], "INTERNAL_ERROR");

    harness.send(json!({"command": "ping", "id": "still-here"})).await;
    let pong = harness.recv().await;
    assert_eq!(pong["id"], "still-here");
    assert_eq!(pong["result"]["pong"], true);

    harness.send(json!({"command": "shutdown", "id": "bye"})).await;
    harness.recv().await;
    assert_eq!(harness.server.await.unwrap().unwrap(), StopReason::Shutdown);
}
