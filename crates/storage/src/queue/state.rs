// SPDX-License-Identifier: MIT

//! Materialized queue state and the events that build it.
//!
//! Every mutation the store performs is first appended to the WAL as a
//! [`QueueEvent`] and then applied here. Application is idempotent so a
//! replay over an existing snapshot converges on the same state.

use dh_core::{ContainerId, InstructionJob, JobId, JobResult, JobStatus, Progress};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A job that exhausted its attempts, preserved for operator inspection.
///
/// Immutable once created; removed only by operator purge or queue
/// destruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: InstructionJob,
    pub buried_at_ms: u64,
}

/// Durable queue mutations, one WAL line each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { job: InstructionJob },
    Claimed { job_id: JobId, at_ms: u64, deadline_ms: u64 },
    Heartbeat { job_id: JobId, deadline_ms: u64 },
    Progressed { job_id: JobId, progress: Progress },
    Completed { job_id: JobId, result: JobResult, at_ms: u64 },
    /// Failure with attempts remaining: delayed for backoff.
    FailedRetry { job_id: JobId, error: String, at_ms: u64, not_before_ms: u64 },
    /// Failure with attempts exhausted: terminal, mirrored to the DLQ.
    FailedDead { job_id: JobId, error: String, at_ms: u64 },
    /// Visibility deadline passed without heartbeat or finalize.
    Expired { job_id: JobId, at_ms: u64 },
    /// Backoff elapsed; the job is claimable again.
    Woke { job_id: JobId },
    Cancelled { job_id: JobId },
    /// Operator re-run of a failed job; attempts reset.
    Retried { job_id: JobId, at_ms: u64 },
    Paused { container_id: ContainerId },
    Resumed { container_id: ContainerId },
    /// Retention removal of terminal job records.
    Pruned { job_ids: Vec<JobId> },
    /// Queue teardown on container delete: all records dropped.
    Destroyed { container_id: ContainerId },
}

/// In-memory queue state rebuilt from snapshot + WAL replay.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub jobs: HashMap<JobId, InstructionJob>,
    pub dead: HashMap<ContainerId, Vec<DeadLetter>>,
    pub paused: HashSet<ContainerId>,
}

impl QueueState {
    pub fn apply(&mut self, event: &QueueEvent) {
        match event {
            QueueEvent::Enqueued { job } => {
                // Idempotency: replay over a snapshot may see the job again
                self.jobs.entry(job.id).or_insert_with(|| job.clone());
            }

            QueueEvent::Claimed { job_id, at_ms, deadline_ms } => {
                if let Some(job) = self.claimable_mut(job_id) {
                    job.status = JobStatus::Active;
                    job.started_at_ms = Some(*at_ms);
                    job.visibility_deadline_ms = Some(*deadline_ms);
                    job.not_before_ms = None;
                }
            }

            QueueEvent::Heartbeat { job_id, deadline_ms } => {
                if let Some(job) = self.active_mut(job_id) {
                    job.visibility_deadline_ms = Some(*deadline_ms);
                }
            }

            QueueEvent::Progressed { job_id, progress } => {
                if let Some(job) = self.active_mut(job_id) {
                    job.progress = Some(progress.clone());
                }
            }

            QueueEvent::Completed { job_id, result, at_ms } => {
                if let Some(job) = self.nonterminal_mut(job_id) {
                    job.status = JobStatus::Completed;
                    job.result = Some(result.clone());
                    job.finished_at_ms = Some(*at_ms);
                    job.visibility_deadline_ms = None;
                }
            }

            QueueEvent::FailedRetry { job_id, error, at_ms, not_before_ms } => {
                if let Some(job) = self.nonterminal_mut(job_id) {
                    job.status = JobStatus::Delayed;
                    job.attempts_made += 1;
                    job.push_error(format!("attempt {}: {}", job.attempts_made, error));
                    job.failure = Some(error.clone());
                    job.not_before_ms = Some(*not_before_ms);
                    job.visibility_deadline_ms = None;
                    job.finished_at_ms = Some(*at_ms);
                }
            }

            QueueEvent::FailedDead { job_id, error, at_ms } => {
                // Field access (not the helper) so `dead` stays borrowable.
                if let Some(job) = self.jobs.get_mut(job_id).filter(|j| !j.is_terminal()) {
                    job.status = JobStatus::Failed;
                    job.attempts_made += 1;
                    job.push_error(format!("attempt {}: {}", job.attempts_made, error));
                    job.failure = Some(error.clone());
                    job.finished_at_ms = Some(*at_ms);
                    job.visibility_deadline_ms = None;
                    let buried = DeadLetter { job: job.clone(), buried_at_ms: *at_ms };
                    self.dead.entry(buried.job.container_id.clone()).or_default().push(buried);
                }
            }

            QueueEvent::Expired { job_id, at_ms: _ } => {
                if let Some(job) = self.active_mut(job_id) {
                    job.status = JobStatus::Waiting;
                    job.attempts_made += 1;
                    job.push_error(format!(
                        "attempt {}: claim visibility expired",
                        job.attempts_made
                    ));
                    job.visibility_deadline_ms = None;
                }
            }

            QueueEvent::Woke { job_id } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    if job.status == JobStatus::Delayed {
                        job.status = JobStatus::Waiting;
                        job.not_before_ms = None;
                    }
                }
            }

            QueueEvent::Cancelled { job_id } => {
                if let Some(job) = self.jobs.get(job_id) {
                    if matches!(job.status, JobStatus::Waiting | JobStatus::Delayed) {
                        self.jobs.remove(job_id);
                    }
                }
            }

            QueueEvent::Retried { job_id, at_ms: _ } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    if job.status == JobStatus::Failed {
                        job.status = JobStatus::Waiting;
                        job.attempts_made = 0;
                        job.failure = None;
                        job.result = None;
                        job.progress = None;
                        job.finished_at_ms = None;
                        job.not_before_ms = None;
                    }
                }
            }

            QueueEvent::Paused { container_id } => {
                self.paused.insert(container_id.clone());
            }

            QueueEvent::Resumed { container_id } => {
                self.paused.remove(container_id);
            }

            QueueEvent::Pruned { job_ids } => {
                for id in job_ids {
                    self.jobs.remove(id);
                }
            }

            QueueEvent::Destroyed { container_id } => {
                self.jobs.retain(|_, job| &job.container_id != container_id);
                self.dead.remove(container_id);
                self.paused.remove(container_id);
            }
        }
    }

    fn claimable_mut(&mut self, id: &JobId) -> Option<&mut InstructionJob> {
        self.jobs.get_mut(id).filter(|j| j.status == JobStatus::Waiting)
    }

    fn active_mut(&mut self, id: &JobId) -> Option<&mut InstructionJob> {
        self.jobs.get_mut(id).filter(|j| j.status == JobStatus::Active)
    }

    /// Terminal states are write-once: finalize/fail events on a terminal
    /// job are ignored on replay.
    fn nonterminal_mut(&mut self, id: &JobId) -> Option<&mut InstructionJob> {
        self.jobs.get_mut(id).filter(|j| !j.is_terminal())
    }
}
