// SPDX-License-Identifier: MIT

//! Persisted usage records with session-bucket aggregation.
//!
//! Append-only JSONL file (`usage.jsonl`) mirrored in memory for
//! summaries. Uniqueness on `(job_id, bucket_id)` rejects double
//! accounting when the same stdout is re-parsed. The janitor rewrites the
//! file dropping records past the 30-day window.

use dh_core::{bucket_end_ms, bucket_id, Clock, ContainerId, JobId, UsageRecord};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Rolling retention for usage records (30 days).
pub const USAGE_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage already recorded for job {job_id} in bucket {bucket_id}")]
    Duplicate { job_id: JobId, bucket_id: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Aggregated token/cost totals over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_micros: u64,
    pub records: usize,
}

impl WindowTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.total_cost_micros += record.total_cost_micros;
        self.records += 1;
    }
}

/// Usage aggregates returned to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub last_24h: WindowTotals,
    pub last_7d: WindowTotals,
    pub current_bucket: WindowTotals,
    /// When the current session bucket closes.
    pub bucket_end_ms: u64,
}

struct Inner {
    records: Vec<UsageRecord>,
    seen: HashSet<(JobId, String)>,
    file: File,
}

/// File-backed usage record store.
pub struct UsageStore<C: Clock> {
    inner: Mutex<Inner>,
    path: PathBuf,
    clock: C,
}

impl<C: Clock> UsageStore<C> {
    pub fn open(dir: &Path, clock: C) -> Result<Self, UsageError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("usage.jsonl");

        let mut records: Vec<UsageRecord> = Vec::new();
        if path.exists() {
            for line in BufReader::new(File::open(&path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(error = %e, "skipping corrupt usage line");
                        break;
                    }
                }
            }
        }

        let seen = records
            .iter()
            .filter_map(|r: &UsageRecord| r.job_id.map(|j| (j, r.bucket_id.clone())))
            .collect();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self { inner: Mutex::new(Inner { records, seen, file }), path, clock })
    }

    /// Persist one record. All-zero records are skipped (`Ok(false)`);
    /// a duplicate `(job_id, bucket_id)` pair is rejected.
    pub fn record(&self, record: UsageRecord) -> Result<bool, UsageError> {
        if record.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();

        if let Some(job_id) = record.job_id {
            let key = (job_id, record.bucket_id.clone());
            if inner.seen.contains(&key) {
                return Err(UsageError::Duplicate { job_id, bucket_id: record.bucket_id });
            }
            inner.seen.insert(key);
        }

        let line = serde_json::to_string(&record)?;
        writeln!(inner.file, "{line}")?;
        inner.file.sync_data()?;
        inner.records.push(record);
        Ok(true)
    }

    /// Aggregates for a container: last 24 h, last 7 d, current bucket.
    pub fn summary(&self, container_id: &ContainerId) -> UsageSummary {
        let now_ms = self.clock.epoch_ms();
        let bucket = bucket_id(container_id, now_ms);
        let day_ago = now_ms.saturating_sub(24 * 60 * 60 * 1000);
        let week_ago = now_ms.saturating_sub(7 * 24 * 60 * 60 * 1000);

        let inner = self.inner.lock();
        let mut summary =
            UsageSummary { bucket_end_ms: bucket_end_ms(now_ms), ..Default::default() };
        for record in inner.records.iter().filter(|r| &r.container_id == container_id) {
            if record.created_at_ms >= day_ago {
                summary.last_24h.add(record);
            }
            if record.created_at_ms >= week_ago {
                summary.last_7d.add(record);
            }
            if record.bucket_id == bucket {
                summary.current_bucket.add(record);
            }
        }
        summary
    }

    /// Drop records older than the 30-day window, rewriting the file.
    pub fn prune_expired(&self) -> Result<usize, UsageError> {
        let cutoff = self.clock.epoch_ms().saturating_sub(USAGE_RETENTION_MS);
        let mut inner = self.inner.lock();

        let before = inner.records.len();
        inner.records.retain(|r| r.created_at_ms >= cutoff);
        let removed = before - inner.records.len();
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in &inner.records {
                let line = serde_json::to_string(record)?;
                writeln!(file, "{line}")?;
            }
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        inner.seen = inner
            .records
            .iter()
            .filter_map(|r| r.job_id.map(|j| (j, r.bucket_id.clone())))
            .collect();

        debug!(removed, "usage retention pruned records");
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
