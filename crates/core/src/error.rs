// SPDX-License-Identifier: MIT

//! Instruction failure taxonomy.
//!
//! Every failure on the instruction path carries a class tag that the
//! worker uses to choose between retry and dead-letter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry classification for instruction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected before reaching a worker; never retried.
    Validation,
    /// Local condition expected to clear; retried with backoff.
    Transient,
    /// Container is authoritatively absent; no retry.
    Gone,
    /// Session did not reach RUNNING in time; retried per queue policy.
    NotReady,
    /// A dispatch is already in flight; surfaced immediately to the caller.
    Busy,
    /// Retries exhausted; the job is a dead letter.
    Exhausted,
}

crate::simple_display! {
    ErrorClass {
        Validation => "validation",
        Transient => "transient",
        Gone => "gone",
        NotReady => "not_ready",
        Busy => "busy",
        Exhausted => "exhausted",
    }
}

/// Failure on the instruction pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionError {
    #[error("invalid container identifier: {0:?}")]
    InvalidContainerId(String),

    #[error("instruction exceeds {max} bytes (got {got})")]
    Oversized { got: usize, max: usize },

    #[error("instruction blocked: {0}")]
    Dangerous(String),

    #[error("transient runtime failure: {0}")]
    Transient(String),

    #[error("container gone: {0}")]
    Gone(String),

    #[error("session not ready: {0}")]
    NotReady(String),

    #[error("dispatch already in flight")]
    Busy,

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl InstructionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidContainerId(_) | Self::Oversized { .. } | Self::Dangerous(_) => {
                ErrorClass::Validation
            }
            Self::Transient(_) => ErrorClass::Transient,
            Self::Gone(_) => ErrorClass::Gone,
            Self::NotReady(_) => ErrorClass::NotReady,
            Self::Busy => ErrorClass::Busy,
            Self::Exhausted { .. } => ErrorClass::Exhausted,
        }
    }

    /// Whether the queue should re-attempt the job (attempts permitting).
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::NotReady | ErrorClass::Busy)
    }
}
