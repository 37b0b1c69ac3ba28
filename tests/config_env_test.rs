//! Config environment variable tests
//!
//! These tests verify that Config::from_env() reads and applies environment
//! variable overrides. Tests use #[serial] to prevent races on shared env vars.

use remediation_governor::config::{Config, FixStoreKind, LogFormat};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

fn clear(keys: &[&str]) {
    for key in keys {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_config_defaults() {
    clear(&[
        "FIX_MEMORY_BACKEND",
        "SYNC_INTERVAL_MS",
        "COMMAND_TIMEOUT_MS",
        "INIT_TIMEOUT_MS",
        "INVESTIGATION_TIMEOUT_SECS",
        "LOG_FILES",
        "STATUS_FILE",
    ]);

    let config = Config::from_env().unwrap();
    assert_eq!(config.memory.backend, FixStoreKind::Sqlite);
    assert_eq!(config.monitor.sync_interval_ms, 1000);
    assert_eq!(config.gateway.command_timeout_ms, 5000);
    assert_eq!(config.gateway.init_timeout_ms, 30000);
    assert_eq!(config.investigation.timeout_secs, 900);
    assert!(config.monitor.log_files.is_empty());
    assert!(config.monitor.status_file.is_none());
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    env::set_var("DATABASE_PATH", "/custom/governor.db");
    env::set_var("DATABASE_MAX_CONNECTIONS", "10");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path, PathBuf::from("/custom/governor.db"));
    assert_eq!(config.database.max_connections, 10);

    clear(&["DATABASE_PATH", "DATABASE_MAX_CONNECTIONS"]);
}

#[test]
#[serial]
fn test_config_from_env_json_backend() {
    env::set_var("FIX_MEMORY_BACKEND", "JSON");
    env::set_var("FIX_MEMORY_PATH", "/tmp/memory.json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.memory.backend, FixStoreKind::Json);
    assert_eq!(config.memory.json_path, PathBuf::from("/tmp/memory.json"));

    clear(&["FIX_MEMORY_BACKEND", "FIX_MEMORY_PATH"]);
}

#[test]
#[serial]
fn test_config_from_env_rejects_unknown_backend() {
    env::set_var("FIX_MEMORY_BACKEND", "carrier-pigeon");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("carrier-pigeon"));

    clear(&["FIX_MEMORY_BACKEND"]);
}

#[test]
#[serial]
fn test_config_from_env_monitor_inputs() {
    env::set_var("LOG_FILES", "logs/server.log, logs/unity.log,,");
    env::set_var("STATUS_FILE", "run/status.json");
    env::set_var("SYNC_INTERVAL_MS", "250");

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.monitor.log_files,
        vec![PathBuf::from("logs/server.log"), PathBuf::from("logs/unity.log")]
    );
    assert_eq!(config.monitor.status_file, Some(PathBuf::from("run/status.json")));
    assert_eq!(config.monitor.sync_interval().as_millis(), 250);

    clear(&["LOG_FILES", "STATUS_FILE", "SYNC_INTERVAL_MS"]);
}

#[test]
#[serial]
fn test_config_from_env_invalid_numbers_fall_back() {
    env::set_var("COMMAND_TIMEOUT_MS", "soon");
    env::set_var("INVESTIGATION_TIMEOUT_SECS", "-5");

    let config = Config::from_env().unwrap();
    assert_eq!(config.gateway.command_timeout_ms, 5000);
    assert_eq!(config.investigation.timeout_secs, 900);

    clear(&["COMMAND_TIMEOUT_MS", "INVESTIGATION_TIMEOUT_SECS"]);
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    env::set_var("LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);

    env::set_var("LOG_FORMAT", "pretty");
    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Pretty);

    clear(&["LOG_FORMAT"]);
}
