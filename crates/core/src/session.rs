// SPDX-License-Identifier: MIT

//! Assistant session model and status machine.

use crate::container::{ContainerId, SessionMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque conversation token for an assistant session.
///
/// Minted once when the session first starts; the first dispatch passes it
/// as the new conversation id and later dispatches resume it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Mint a fresh random token.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session status. Transitions form a DAG enforced by [`Session::transition`]:
///
/// ```text
/// STARTING → RUNNING ⇄ PROCESSING
/// RUNNING | PROCESSING | STARTING → STOPPING → STOPPED → STARTING
/// any → ERROR → STARTING (operator restart)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Processing,
    Stopping,
    Stopped,
    Error,
}

crate::simple_display! {
    SessionStatus {
        Starting => "starting",
        Running => "running",
        Processing => "processing",
        Stopping => "stopping",
        Stopped => "stopped",
        Error => "error",
    }
}

impl SessionStatus {
    /// Whether a transition to `to` is legal.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        if to == Error {
            return true;
        }
        match self {
            Starting => matches!(to, Running | Stopping),
            Running => matches!(to, Processing | Stopping),
            Processing => matches!(to, Running | Stopping),
            Stopping => matches!(to, Stopped),
            // Restart paths: a stopped or errored session may start again.
            Stopped | Error => matches!(to, Starting),
        }
    }

    /// Healthy states for the health monitor's probe.
    pub fn is_healthy(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Processing)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal session transition {from} → {to}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// A per-container assistant session. At most one exists per container id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub container_id: ContainerId,
    pub status: SessionStatus,
    /// Minted on first start; survives restarts of the child process so
    /// later dispatches resume the same conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SessionToken>,
    pub mode: SessionMode,
    pub started_at_ms: u64,
    pub last_activity_ms: u64,
    pub instruction_count: u64,
    /// True while a dispatch owns the session. No new dispatch is accepted
    /// until cleared.
    pub in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub fn new(container_id: ContainerId, mode: SessionMode, now_ms: u64) -> Self {
        Self {
            container_id,
            status: SessionStatus::Starting,
            token: None,
            mode,
            started_at_ms: now_ms,
            last_activity_ms: now_ms,
            instruction_count: 0,
            in_flight: false,
            error: None,
        }
    }

    /// Apply a status transition, enforcing the DAG.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        if to != SessionStatus::Error {
            self.error = None;
        }
        Ok(())
    }

    /// Advance `last_activity_ms`. Monotonic: earlier timestamps are ignored.
    pub fn touch(&mut self, now_ms: u64) {
        if now_ms > self.last_activity_ms {
            self.last_activity_ms = now_ms;
        }
    }

    /// Whether the next dispatch mints the conversation (`true`) or
    /// resumes it.
    pub fn is_first_dispatch(&self) -> bool {
        self.instruction_count == 0
    }

    /// Idle duration relative to `now_ms`, for the evictor.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
