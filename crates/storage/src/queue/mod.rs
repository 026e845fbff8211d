// SPDX-License-Identifier: MIT

//! Durable per-container instruction queue.
//!
//! Single-writer store: every mutation appends a [`QueueEvent`] to the
//! WAL (fsync'd) before touching materialized state, so a crash between
//! the two replays to the same outcome. Claims hand out a visibility
//! window; jobs whose window lapses without a heartbeat return to
//! `waiting` with an attempt charged. Failures with attempts remaining
//! are delayed on an exponential backoff; exhausted jobs are buried in
//! the dead-letter set.

mod state;

pub use state::{DeadLetter, QueueEvent, QueueState};

use crate::snapshot;
use crate::wal::{Wal, WalError};
use dh_core::{
    Clock, ContainerId, InstructionJob, JobId, JobPayload, JobResult, JobStatus, Progress,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Retry backoff base delay (5 s), doubling per attempt.
const BACKOFF_BASE_MS: u64 = 5_000;
/// Retry backoff ceiling (60 s).
const BACKOFF_CAP_MS: u64 = 60_000;

/// Completed job records kept at most this long / this many per container.
const COMPLETED_MAX_AGE_MS: u64 = 60 * 60 * 1000;
const COMPLETED_MAX_COUNT: usize = 100;
/// Failed job records kept at most this long / this many per container.
const FAILED_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;
const FAILED_MAX_COUNT: usize = 200;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} is {status}; {op} not permitted")]
    InvalidState { job_id: JobId, status: JobStatus, op: &'static str },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::SnapshotError),
}

/// Per-container queue counters. When the container is paused its
/// claimable jobs are reported under `paused` instead of `waiting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
}

/// Outcome of [`QueueStore::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempts remain; the job sleeps until `not_before_ms`.
    Retrying { attempt: u32, not_before_ms: u64 },
    /// Attempts exhausted; the job is terminal and buried.
    DeadLettered { attempts: u32 },
}

struct Inner {
    wal: Wal<QueueEvent>,
    state: QueueState,
    snapshot_path: PathBuf,
}

impl Inner {
    /// Append to the WAL and apply to state in one step.
    fn commit(&mut self, event: QueueEvent) -> Result<(), QueueError> {
        self.wal.append(&event)?;
        self.state.apply(&event);
        Ok(())
    }
}

/// Durable instruction queue for all containers.
pub struct QueueStore<C: Clock> {
    inner: Mutex<Inner>,
    clock: C,
}

impl<C: Clock> QueueStore<C> {
    /// Open the store under `dir`, replaying snapshot + WAL.
    pub fn open(dir: &Path, clock: C) -> Result<Self, QueueError> {
        let snapshot_path = dir.join("queue.snapshot.zst");
        let wal_path = dir.join("queue.wal");

        let mut state: QueueState = snapshot::load(&snapshot_path).unwrap_or_default();
        let wal = Wal::open(&wal_path, |event| state.apply(&event))?;
        let jobs = state.jobs.len();
        if jobs > 0 {
            info!(jobs, "queue state recovered");
        }

        Ok(Self { inner: Mutex::new(Inner { wal, state, snapshot_path }), clock })
    }

    /// Append a job. Durable before returning. Returns the job id and the
    /// container's waiting count after the append.
    pub fn enqueue(&self, payload: JobPayload) -> Result<(JobId, usize), QueueError> {
        let job = InstructionJob::new(payload, self.clock.epoch_ms());
        let job_id = job.id;
        let container_id = job.container_id.clone();

        let mut inner = self.inner.lock();
        inner.commit(QueueEvent::Enqueued { job })?;
        let waiting = count_status(&inner.state, &container_id, JobStatus::Waiting);
        debug!(%container_id, %job_id, waiting, "job enqueued");
        Ok((job_id, waiting))
    }

    /// Claim the best waiting job for a container, marking it active for
    /// `visibility`. Returns `None` while the container is paused or no
    /// job is due.
    ///
    /// Runs the expiry/wake sweep first so a lapsed claim or an elapsed
    /// backoff is immediately claimable.
    pub fn claim(
        &self,
        container_id: &ContainerId,
        visibility: Duration,
    ) -> Result<Option<InstructionJob>, QueueError> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        sweep_locked(&mut inner, now)?;

        if inner.state.paused.contains(container_id) {
            return Ok(None);
        }
        // Invariant: at most one active job per container.
        if count_status(&inner.state, container_id, JobStatus::Active) > 0 {
            return Ok(None);
        }

        let best = inner
            .state
            .jobs
            .values()
            .filter(|j| &j.container_id == container_id && j.status == JobStatus::Waiting)
            .min_by_key(|j| j.claim_key())
            .map(|j| j.id);

        let Some(job_id) = best else { return Ok(None) };
        let deadline_ms = now + visibility.as_millis() as u64;
        inner.commit(QueueEvent::Claimed { job_id, at_ms: now, deadline_ms })?;
        Ok(inner.state.jobs.get(&job_id).cloned())
    }

    /// Extend the visibility window of an active job.
    pub fn heartbeat(&self, job_id: JobId, visibility: Duration) -> Result<(), QueueError> {
        let deadline_ms = self.clock.epoch_ms() + visibility.as_millis() as u64;
        let mut inner = self.inner.lock();
        require_status(&inner.state, job_id, JobStatus::Active, "heartbeat")?;
        inner.commit(QueueEvent::Heartbeat { job_id, deadline_ms })
    }

    /// Persist worker-reported progress on an active job.
    pub fn update_progress(&self, job_id: JobId, progress: Progress) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        require_status(&inner.state, job_id, JobStatus::Active, "progress")?;
        inner.commit(QueueEvent::Progressed { job_id, progress })
    }

    /// Terminal success. Write-once: a second finalize is an error.
    pub fn finalize(&self, job_id: JobId, result: JobResult) -> Result<(), QueueError> {
        let at_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let job = get_job(&inner.state, job_id)?;
        if job.is_terminal() {
            return Err(QueueError::InvalidState { job_id, status: job.status, op: "finalize" });
        }
        let container_id = job.container_id.clone();
        inner.commit(QueueEvent::Completed { job_id, result, at_ms })?;
        enforce_retention(&mut inner, &container_id, at_ms)
    }

    /// Record a failed attempt. Delays for backoff while attempts remain,
    /// otherwise buries the job in the dead-letter set.
    pub fn fail(&self, job_id: JobId, error: &str) -> Result<FailOutcome, QueueError> {
        let at_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let job = get_job(&inner.state, job_id)?;
        if job.is_terminal() {
            return Err(QueueError::InvalidState { job_id, status: job.status, op: "fail" });
        }
        let container_id = job.container_id.clone();
        let attempt = job.attempts_made + 1;

        let outcome = if attempt < job.max_attempts {
            let not_before_ms = at_ms + backoff_ms(attempt);
            inner.commit(QueueEvent::FailedRetry {
                job_id,
                error: error.to_string(),
                at_ms,
                not_before_ms,
            })?;
            FailOutcome::Retrying { attempt, not_before_ms }
        } else {
            inner.commit(QueueEvent::FailedDead { job_id, error: error.to_string(), at_ms })?;
            enforce_retention(&mut inner, &container_id, at_ms)?;
            FailOutcome::DeadLettered { attempts: attempt }
        };
        Ok(outcome)
    }

    /// Bury a job immediately, regardless of attempts remaining. Used for
    /// failures that no retry can fix (validation, container gone).
    pub fn bury(&self, job_id: JobId, error: &str) -> Result<(), QueueError> {
        let at_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let job = get_job(&inner.state, job_id)?;
        if job.is_terminal() {
            return Err(QueueError::InvalidState { job_id, status: job.status, op: "bury" });
        }
        let container_id = job.container_id.clone();
        inner.commit(QueueEvent::FailedDead { job_id, error: error.to_string(), at_ms })?;
        enforce_retention(&mut inner, &container_id, at_ms)
    }

    /// Remove a waiting or delayed job. Returns false for any other state.
    pub fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        let job = get_job(&inner.state, job_id)?;
        if !matches!(job.status, JobStatus::Waiting | JobStatus::Delayed) {
            return Ok(false);
        }
        inner.commit(QueueEvent::Cancelled { job_id })?;
        Ok(true)
    }

    /// Re-enqueue a failed job with attempts reset to zero.
    pub fn retry(&self, job_id: JobId) -> Result<(), QueueError> {
        let at_ms = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        require_status(&inner.state, job_id, JobStatus::Failed, "retry")?;
        inner.commit(QueueEvent::Retried { job_id, at_ms })
    }

    /// Stop claims for a container. Enqueues are still accepted.
    pub fn pause(&self, container_id: &ContainerId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.state.paused.contains(container_id) {
            return Ok(());
        }
        inner.commit(QueueEvent::Paused { container_id: container_id.clone() })
    }

    /// Re-enable claims for a container.
    pub fn resume(&self, container_id: &ContainerId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if !inner.state.paused.contains(container_id) {
            return Ok(());
        }
        inner.commit(QueueEvent::Resumed { container_id: container_id.clone() })
    }

    pub fn is_paused(&self, container_id: &ContainerId) -> bool {
        self.inner.lock().state.paused.contains(container_id)
    }

    /// Return expired-claim job ids after running the sweep. Also wakes
    /// due delayed jobs and enforces terminal-record retention.
    pub fn sweep(&self) -> Result<Vec<JobId>, QueueError> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        sweep_locked(&mut inner, now)
    }

    pub fn stats(&self, container_id: &ContainerId) -> QueueStats {
        let inner = self.inner.lock();
        let paused = inner.state.paused.contains(container_id);
        let mut stats = QueueStats::default();
        for job in inner.state.jobs.values().filter(|j| &j.container_id == container_id) {
            match job.status {
                JobStatus::Waiting if paused => stats.paused += 1,
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Paused => stats.paused += 1,
            }
        }
        stats
    }

    /// Most-recent terminal jobs for a container, newest first.
    pub fn history(&self, container_id: &ContainerId, limit: usize) -> Vec<InstructionJob> {
        let inner = self.inner.lock();
        let mut terminal: Vec<InstructionJob> = inner
            .state
            .jobs
            .values()
            .filter(|j| &j.container_id == container_id && j.is_terminal())
            .cloned()
            .collect();
        terminal.sort_by_key(|j| std::cmp::Reverse(j.finished_at_ms.unwrap_or(0)));
        terminal.truncate(limit);
        terminal
    }

    /// Paginated dead-letter records, newest first.
    pub fn dead_letters(&self, container_id: &ContainerId, limit: usize) -> Vec<DeadLetter> {
        let inner = self.inner.lock();
        let mut letters = inner.state.dead.get(container_id).cloned().unwrap_or_default();
        letters.sort_by_key(|d| std::cmp::Reverse(d.buried_at_ms));
        letters.truncate(limit);
        letters
    }

    pub fn get(&self, job_id: JobId) -> Option<InstructionJob> {
        self.inner.lock().state.jobs.get(&job_id).cloned()
    }

    /// Count of jobs currently claimed for a container (used by the
    /// lifecycle drain).
    pub fn active_count(&self, container_id: &ContainerId) -> usize {
        count_status(&self.inner.lock().state, container_id, JobStatus::Active)
    }

    /// Drop every record for a container: jobs, dead letters, pause flag.
    pub fn destroy(&self, container_id: &ContainerId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        inner.commit(QueueEvent::Destroyed { container_id: container_id.clone() })
    }

    /// Write a snapshot and truncate the WAL.
    pub fn checkpoint(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let Inner { wal, state, snapshot_path } = &mut *inner;
        snapshot::save(snapshot_path, state)?;
        wal.truncate()?;
        Ok(())
    }
}

/// Backoff before attempt `n + 1`, where `n` ≥ 1 failures have occurred.
pub(crate) fn backoff_ms(failures: u32) -> u64 {
    BACKOFF_BASE_MS
        .saturating_mul(1u64 << (failures.saturating_sub(1)).min(10))
        .min(BACKOFF_CAP_MS)
}

fn count_status(state: &QueueState, container_id: &ContainerId, status: JobStatus) -> usize {
    state
        .jobs
        .values()
        .filter(|j| &j.container_id == container_id && j.status == status)
        .count()
}

fn get_job(state: &QueueState, job_id: JobId) -> Result<InstructionJob, QueueError> {
    state.jobs.get(&job_id).cloned().ok_or(QueueError::NotFound(job_id))
}

fn require_status(
    state: &QueueState,
    job_id: JobId,
    status: JobStatus,
    op: &'static str,
) -> Result<(), QueueError> {
    let job = get_job(state, job_id)?;
    if job.status != status {
        return Err(QueueError::InvalidState { job_id, status: job.status, op });
    }
    Ok(())
}

fn sweep_locked(inner: &mut Inner, now_ms: u64) -> Result<Vec<JobId>, QueueError> {
    let expired: Vec<JobId> = inner
        .state
        .jobs
        .values()
        .filter(|j| {
            j.status == JobStatus::Active
                && j.visibility_deadline_ms.is_some_and(|deadline| deadline <= now_ms)
        })
        .map(|j| j.id)
        .collect();
    for job_id in &expired {
        debug!(%job_id, "claim visibility expired, returning job to waiting");
        inner.commit(QueueEvent::Expired { job_id: *job_id, at_ms: now_ms })?;
    }

    let due: Vec<JobId> = inner
        .state
        .jobs
        .values()
        .filter(|j| {
            j.status == JobStatus::Delayed
                && j.not_before_ms.is_some_and(|not_before| not_before <= now_ms)
        })
        .map(|j| j.id)
        .collect();
    for job_id in due {
        inner.commit(QueueEvent::Woke { job_id })?;
    }

    let containers: Vec<ContainerId> =
        inner.state.jobs.values().map(|j| j.container_id.clone()).collect();
    for container_id in dedup(containers) {
        enforce_retention(inner, &container_id, now_ms)?;
    }

    Ok(expired)
}

fn dedup(mut ids: Vec<ContainerId>) -> Vec<ContainerId> {
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    ids.dedup();
    ids
}

/// Drop terminal records beyond the age/count retention bounds.
fn enforce_retention(
    inner: &mut Inner,
    container_id: &ContainerId,
    now_ms: u64,
) -> Result<(), QueueError> {
    let mut prune: Vec<JobId> = Vec::new();
    for (status, max_age_ms, max_count) in [
        (JobStatus::Completed, COMPLETED_MAX_AGE_MS, COMPLETED_MAX_COUNT),
        (JobStatus::Failed, FAILED_MAX_AGE_MS, FAILED_MAX_COUNT),
    ] {
        let mut terminal: Vec<&InstructionJob> = inner
            .state
            .jobs
            .values()
            .filter(|j| &j.container_id == container_id && j.status == status)
            .collect();
        terminal.sort_by_key(|j| std::cmp::Reverse(j.finished_at_ms.unwrap_or(0)));

        for (idx, job) in terminal.iter().enumerate() {
            let expired = job
                .finished_at_ms
                .is_some_and(|finished| now_ms.saturating_sub(finished) > max_age_ms);
            if idx >= max_count || expired {
                prune.push(job.id);
            }
        }
    }

    if !prune.is_empty() {
        debug!(%container_id, pruned = prune.len(), "retention pruned terminal job records");
        inner.commit(QueueEvent::Pruned { job_ids: prune })?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
