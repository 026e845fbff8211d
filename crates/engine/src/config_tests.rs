// SPDX-License-Identifier: MIT

use super::*;
use serial_test::serial;

#[test]
fn defaults_match_contract() {
    let config = EngineConfig::default();
    assert_eq!(config.health.check_interval_ms, 30_000);
    assert_eq!(config.health.max_recovery_attempts, 3);
    assert_eq!(config.health.recovery_delay_ms, 5_000);
    assert_eq!(config.session.idle_timeout_ms, 30 * 60_000);
    assert_eq!(config.session.evict_interval_ms, 60_000);
    assert_eq!(config.session.barrier_timeout_ms, 10 * 60_000);
    assert_eq!(config.session.capture_limit_bytes, 16 * 1024 * 1024);
    assert_eq!(config.worker.rate_limit_max, 10);
    assert_eq!(config.worker.rate_limit_window_ms, 60_000);
    assert_eq!(config.collector.batch_size, 100);
    assert_eq!(config.collector.batch_interval_ms, 1_000);
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::load(&dir.path().join("config.toml")).unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
#[serial]
fn partial_toml_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[health]
max_recovery_attempts = 5

[session]
idle_timeout_ms = 60000
"#,
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.health.max_recovery_attempts, 5);
    assert_eq!(config.session.idle_timeout_ms, 60_000);
    // Untouched sections keep defaults.
    assert_eq!(config.worker.rate_limit_max, 10);
}

#[test]
#[serial]
fn env_overrides_beat_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[health]\ncheck_interval_ms = 10000\n").unwrap();

    std::env::set_var("DH_HEALTH_CHECK_INTERVAL_MS", "7000");
    let config = EngineConfig::load(&path).unwrap();
    std::env::remove_var("DH_HEALTH_CHECK_INTERVAL_MS");

    assert_eq!(config.health.check_interval_ms, 7_000);
}

#[test]
#[serial]
fn invalid_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "not [valid toml").unwrap();
    assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
fn shared_config_reload_is_visible_to_readers() {
    let shared = EngineConfig::default().into_shared();
    assert_eq!(shared.read().health.max_recovery_attempts, 3);

    // Simulates the SIGHUP path: write a new config through the handle.
    shared.write().health.max_recovery_attempts = 7;
    assert_eq!(shared.read().health.max_recovery_attempts, 7);
}
