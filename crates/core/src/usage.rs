// SPDX-License-Identifier: MIT

//! Token/cost usage records and session-bucket arithmetic.
//!
//! Usage is aggregated per container into 5-hour wall-clock buckets
//! aligned to the epoch, so all records within one bucket share an id
//! regardless of when the daemon restarted.

use crate::container::ContainerId;
use crate::job::JobId;
use serde::{Deserialize, Serialize};

/// Width of a session bucket: 5 hours.
pub const USAGE_BUCKET_MS: u64 = 5 * 60 * 60 * 1000;

/// Bucket identifier: `<container_id>:<bucket start, epoch seconds>`.
pub fn bucket_id(container_id: &ContainerId, now_ms: u64) -> String {
    let start_ms = now_ms - (now_ms % USAGE_BUCKET_MS);
    format!("{}:{}", container_id, start_ms / 1000)
}

/// End of the bucket containing `now_ms`, for client display.
pub fn bucket_end_ms(now_ms: u64) -> u64 {
    now_ms - (now_ms % USAGE_BUCKET_MS) + USAGE_BUCKET_MS
}

/// A persisted usage record extracted from one assistant `result` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub container_id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub bucket_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Total cost in micro-dollars (USD × 1e6), avoiding float drift in sums.
    pub total_cost_micros: u64,
    pub created_at_ms: u64,
}

impl UsageRecord {
    /// True when every counter is zero; such records are not persisted.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_cost_micros == 0
    }
}

/// Convert a `total_cost_usd` float from the assistant's result event
/// into micro-dollars, saturating at zero for negative or NaN input.
pub fn cost_micros(total_cost_usd: f64) -> u64 {
    if total_cost_usd.is_finite() && total_cost_usd > 0.0 {
        (total_cost_usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
