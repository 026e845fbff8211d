// SPDX-License-Identifier: MIT

//! Instruction job model and state machine.

use crate::container::{ContainerId, SessionMode};
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for an instruction job.
    ///
    /// Assigned at enqueue time; used to track the job through claim,
    /// completion, retry, and the dead-letter set.
    pub struct JobId("job-");
}

/// Default number of delivery attempts before a job is buried.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Maximum instruction size in bytes (10 KiB).
pub const MAX_INSTRUCTION_BYTES: usize = 10 * 1024;

/// Claim priority. Lower values are claimed first; ties break by enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Interactive,
    Autonomous,
}

impl Priority {
    pub fn for_mode(mode: SessionMode) -> Self {
        match mode {
            SessionMode::Interactive => Priority::Interactive,
            SessionMode::Autonomous => Priority::Autonomous,
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        match p {
            Priority::Interactive => 1,
            Priority::Autonomous => 2,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Priority::Interactive),
            2 => Ok(Priority::Autonomous),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

/// Queue status of an instruction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claim.
    Waiting,
    /// Claimed by a worker; invisible to other claims until the
    /// visibility deadline passes.
    Active,
    /// Finished successfully. Terminal, write-once.
    Completed,
    /// Failed. Terminal once attempts are exhausted (the job is then
    /// mirrored into the dead-letter set).
    Failed,
    /// Waiting out a retry backoff; promoted to `Waiting` when due.
    Delayed,
    /// Queue is paused for the container; not claimable.
    Paused,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

crate::simple_display! {
    JobStatus {
        Waiting => "waiting",
        Active => "active",
        Completed => "completed",
        Failed => "failed",
        Delayed => "delayed",
        Paused => "paused",
    }
}

/// Pipeline stage the worker reports while driving a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    CheckingDaemon,
    StartingDaemon,
    SendingInstruction,
    Processing,
    Finalizing,
    Completed,
}

crate::simple_display! {
    Stage {
        Validating => "validating",
        CheckingDaemon => "checking_daemon",
        StartingDaemon => "starting_daemon",
        SendingInstruction => "sending_instruction",
        Processing => "processing",
        Finalizing => "finalizing",
        Completed => "completed",
    }
}

/// Worker-reported progress, advanced after each stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub stage: Stage,
    pub message: String,
    pub updated_at_ms: u64,
}

/// Captured result of a completed dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdout_truncated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stderr_truncated: bool,
}

/// Enqueue payload accepted from external collaborators.
///
/// `created_at` is an RFC 3339 timestamp stamped by the enqueuer; the
/// store records its own epoch-ms ordering timestamp independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub container_id: ContainerId,
    pub instruction: String,
    pub mode: SessionMode,
    pub priority: Priority,
    pub created_at: String,
}

/// A durable instruction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionJob {
    pub id: JobId,
    pub container_id: ContainerId,
    pub instruction: String,
    pub mode: SessionMode,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Store-assigned ordering timestamp (tie-break within a priority).
    pub enqueued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    /// While `Active`: claim expires at this time unless heartbeated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_deadline_ms: Option<u64>,
    /// While `Delayed`: not claimable before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Errors from prior attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_stack: Vec<String>,
}

impl InstructionJob {
    pub fn new(payload: JobPayload, enqueued_at_ms: u64) -> Self {
        Self {
            id: JobId::new(),
            container_id: payload.container_id,
            instruction: payload.instruction,
            mode: payload.mode,
            priority: payload.priority,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at_ms,
            started_at_ms: None,
            finished_at_ms: None,
            visibility_deadline_ms: None,
            not_before_ms: None,
            progress: None,
            result: None,
            failure: None,
            error_stack: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another delivery is permitted after a failure.
    pub fn attempts_remain(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Record an attempt error on the stack (most recent last).
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.error_stack.push(error.into());
    }

    /// Claim sort key: priority ascending, then enqueue time ascending.
    pub fn claim_key(&self) -> (u8, u64) {
        (u8::from(self.priority), self.enqueued_at_ms)
    }
}

crate::builder! {
    pub struct InstructionJobBuilder => InstructionJob {
        into {
            container_id: ContainerId = "c1",
            instruction: String = "echo hello",
        }
        set {
            mode: SessionMode = SessionMode::Interactive,
            priority: Priority = Priority::Interactive,
            status: JobStatus = JobStatus::Waiting,
            attempts_made: u32 = 0,
            max_attempts: u32 = DEFAULT_MAX_ATTEMPTS,
            enqueued_at_ms: u64 = 1_000_000,
            error_stack: Vec<String> = Vec::new(),
        }
        option {
            started_at_ms: u64 = None,
            finished_at_ms: u64 = None,
            visibility_deadline_ms: u64 = None,
            not_before_ms: u64 = None,
            progress: Progress = None,
            result: JobResult = None,
            failure: String = None,
        }
        computed {
            id: JobId = JobId::new(),
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
