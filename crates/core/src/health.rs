// SPDX-License-Identifier: MIT

//! Per-container health state owned by the health monitor.

use crate::container::ContainerId;
use serde::{Deserialize, Serialize};

/// Health state for one monitored container.
///
/// While `recovering` is true no new probe is launched for the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub container_id: ContainerId,
    pub healthy: bool,
    pub last_check_ms: u64,
    pub consecutive_failures: u32,
    pub recovering: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthState {
    pub fn new(container_id: ContainerId) -> Self {
        Self {
            container_id,
            healthy: true,
            last_check_ms: 0,
            consecutive_failures: 0,
            recovering: false,
            last_error: None,
        }
    }

    /// Record a healthy probe, clearing any failure streak.
    ///
    /// Returns true if this probe recovered from an unhealthy streak.
    pub fn mark_healthy(&mut self, now_ms: u64) -> bool {
        let recovered = !self.healthy;
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_check_ms = now_ms;
        self.last_error = None;
        recovered
    }

    /// Record an unhealthy probe and bump the failure streak.
    pub fn mark_unhealthy(&mut self, now_ms: u64, error: impl Into<String>) {
        self.healthy = false;
        self.consecutive_failures += 1;
        self.last_check_ms = now_ms;
        self.last_error = Some(error.into());
    }
}
