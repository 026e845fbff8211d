// SPDX-License-Identifier: MIT

//! Engine configuration knobs.
//!
//! Loaded from `config.toml` under the state directory with `DH_*`
//! environment overrides, then held behind a shared `RwLock` so SIGHUP
//! can swap in fresh values while the component loops keep running. The
//! loops re-read their knobs each tick, which is what makes the health
//! and eviction settings live-reloadable.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Health monitor knobs (live-reloadable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub max_recovery_attempts: u32,
    pub recovery_delay_ms: u64,
    /// Settle time before verifying a recovery restart took.
    pub verify_delay_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            max_recovery_attempts: 3,
            recovery_delay_ms: 5_000,
            verify_delay_ms: 2_000,
        }
    }
}

/// Session manager knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Assistant binary invoked inside the container.
    pub assistant_bin: String,
    /// Fixed workspace path inside every container.
    pub workspace_dir: String,
    pub evict_interval_ms: u64,
    pub idle_timeout_ms: u64,
    /// Background-agent quiescence barrier.
    pub barrier_poll_ms: u64,
    pub barrier_timeout_ms: u64,
    /// Max bytes captured per stdio channel before truncation (16 MiB).
    pub capture_limit_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assistant_bin: "claude".to_string(),
            workspace_dir: "/workspace".to_string(),
            evict_interval_ms: 60_000,
            idle_timeout_ms: 30 * 60_000,
            barrier_poll_ms: 2_000,
            barrier_timeout_ms: 10 * 60_000,
            capture_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Instruction worker knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub visibility_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Idle poll cadence between claims.
    pub poll_interval_ms: u64,
    /// Session readiness wait after starting the daemon.
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    /// Token bucket: at most `rate_limit_max` claims per window.
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            poll_interval_ms: 500,
            ready_timeout_ms: 10_000,
            ready_poll_ms: 500,
            rate_limit_max: 10,
            rate_limit_window_ms: 60_000,
        }
    }
}

/// Log collector knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub janitor_interval_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval_ms: 1_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 3,
            janitor_interval_ms: 60 * 60 * 1000,
        }
    }
}

/// All engine knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub health: HealthConfig,
    pub session: SessionConfig,
    pub worker: WorkerConfig,
    pub collector: CollectorConfig,
}

/// Handle the running loops read their knobs through.
pub type SharedConfig = Arc<RwLock<EngineConfig>>;

impl EngineConfig {
    /// Load from a TOML file (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    fn apply_env(&mut self) {
        env_u64("DH_HEALTH_CHECK_INTERVAL_MS", &mut self.health.check_interval_ms);
        env_u32("DH_HEALTH_MAX_RECOVERY_ATTEMPTS", &mut self.health.max_recovery_attempts);
        env_u64("DH_HEALTH_RECOVERY_DELAY_MS", &mut self.health.recovery_delay_ms);
        env_u64("DH_SESSION_EVICT_INTERVAL_MS", &mut self.session.evict_interval_ms);
        env_u64("DH_SESSION_IDLE_TIMEOUT_MS", &mut self.session.idle_timeout_ms);
        if let Ok(bin) = std::env::var("DH_ASSISTANT_BIN") {
            if !bin.is_empty() {
                self.session.assistant_bin = bin;
            }
        }
    }
}

fn env_u64(var: &str, slot: &mut u64) {
    if let Some(value) = std::env::var(var).ok().and_then(|s| s.parse().ok()) {
        *slot = value;
    }
}

fn env_u32(var: &str, slot: &mut u32) {
    if let Some(value) = std::env::var(var).ok().and_then(|s| s.parse().ok()) {
        *slot = value;
    }
}

/// Millisecond knob to `Duration`.
pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
