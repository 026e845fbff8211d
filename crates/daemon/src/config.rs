// SPDX-License-Identifier: MIT

//! Daemon configuration and state-directory layout.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine state directory (no home directory)")]
    NoStateDir,
    #[error("failed to create state directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem layout under the daemon's state directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root state directory (e.g. ~/.local/state/dockhand)
    pub state_dir: PathBuf,
    /// Path to lock/PID file
    pub lock_path: PathBuf,
    /// Path to daemon log file
    pub log_path: PathBuf,
    /// Engine knobs (TOML, live-reloaded on SIGHUP)
    pub engine_config_path: PathBuf,
    /// Container records maintained by the external record layer
    pub containers_path: PathBuf,
}

impl Config {
    /// Load configuration for the user-level daemon.
    ///
    /// Uses fixed paths under `$XDG_STATE_HOME/dockhand/` (falling back
    /// to `~/.local/state/dockhand/`), overridable with `DH_STATE_DIR`.
    pub fn load() -> Result<Self, ConfigError> {
        let state_dir = state_dir()?;
        std::fs::create_dir_all(&state_dir)?;

        Ok(Self {
            lock_path: state_dir.join("daemon.pid"),
            log_path: state_dir.join("daemon.log"),
            engine_config_path: state_dir.join("config.toml"),
            containers_path: state_dir.join("containers.json"),
            state_dir,
        })
    }
}

fn state_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var("DH_STATE_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
        .map(|base| base.join("dockhand"))
        .ok_or(ConfigError::NoStateDir)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
