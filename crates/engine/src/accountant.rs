// SPDX-License-Identifier: MIT

//! Token and cost accounting from assistant result events.
//!
//! The worker hands over a completed dispatch's stdout; every `result`
//! record with nonzero usage becomes one persisted record keyed by the
//! container's current 5-hour session bucket. Re-parsing the same stdout
//! is harmless: the store's `(job_id, bucket_id)` uniqueness rejects the
//! duplicate.

use dh_core::{bucket_id, cost_micros, Clock, ContainerId, JobId, UsageRecord};
use dh_storage::{UsageError, UsageStore, UsageSummary};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Janitor cadence: daily.
const JANITOR_INTERVAL_SECS: u64 = 24 * 60 * 60;

pub struct UsageAccountant<C: Clock> {
    store: Arc<UsageStore<C>>,
    clock: C,
}

impl<C: Clock> UsageAccountant<C> {
    pub fn new(store: Arc<UsageStore<C>>, clock: C) -> Self {
        Self { store, clock }
    }

    /// Scan a dispatch's stdout for `result` records and persist their
    /// usage. Returns how many records were stored.
    pub fn record(&self, container_id: &ContainerId, job_id: Option<JobId>, stdout: &str) -> usize {
        let now_ms = self.clock.epoch_ms();
        let bucket = bucket_id(container_id, now_ms);
        let mut stored = 0;

        for line in stdout.lines() {
            let Some(usage) = parse_result_usage(line) else { continue };
            let record = UsageRecord {
                container_id: container_id.clone(),
                job_id,
                bucket_id: bucket.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_cost_micros: usage.cost_micros,
                created_at_ms: now_ms,
            };
            match self.store.record(record) {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(UsageError::Duplicate { job_id, bucket_id }) => {
                    debug!(%job_id, bucket_id, "usage already recorded");
                }
                Err(e) => warn!(%container_id, error = %e, "usage record failed"),
            }
        }
        stored
    }

    pub fn summary(&self, container_id: &ContainerId) -> UsageSummary {
        self.store.summary(container_id)
    }

    /// Daily retention janitor.
    pub async fn run_janitor(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(JANITOR_INTERVAL_SECS)) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.store.prune_expired() {
                Ok(removed) if removed > 0 => {
                    debug!(removed, "usage janitor pruned records");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "usage janitor failed"),
            }
        }
    }
}

struct ParsedUsage {
    input_tokens: u64,
    output_tokens: u64,
    cost_micros: u64,
}

/// Extract usage from one stdout line if it is a `result` record.
fn parse_result_usage(line: &str) -> Option<ParsedUsage> {
    let json: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    if json.get("type").and_then(|v| v.as_str()) != Some("result") {
        return None;
    }
    let usage = json.get("usage");
    Some(ParsedUsage {
        input_tokens: usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cost_micros: cost_micros(
            json.get("total_cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
        ),
    })
}

#[cfg(test)]
#[path = "accountant_tests.rs"]
mod tests;
