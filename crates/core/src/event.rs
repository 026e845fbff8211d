// SPDX-License-Identifier: MIT

//! Typed events fanned out to external collaborators.
//!
//! Serializes with `{"type": "ns:verb", ...fields}` format. Every variant
//! carries the container id and an epoch-ms timestamp. Unknown type tags
//! deserialize to `Custom`.

use crate::container::ContainerId;
use crate::job::{JobId, Priority, Stage};
use serde::{Deserialize, Serialize};

/// Record kinds parsed from the assistant child's stdout stream.
///
/// Anything the parser does not recognize maps to `System`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantRecordKind {
    Assistant,
    User,
    ToolUse,
    ToolResult,
    Result,
    Error,
    System,
}

impl AssistantRecordKind {
    /// Map a raw `type` tag from an assistant stdout record.
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "assistant" => Self::Assistant,
            "user" => Self::User,
            "tool_use" => Self::ToolUse,
            "tool_result" => Self::ToolResult,
            "result" => Self::Result,
            "error" => Self::Error,
            _ => Self::System,
        }
    }
}

crate::simple_display! {
    AssistantRecordKind {
        Assistant => "assistant",
        User => "user",
        ToolUse => "tool_use",
        ToolResult => "tool_result",
        Result => "result",
        Error => "error",
        System => "system",
    }
}

/// Events published on the bus by the orchestration components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- instruction --
    #[serde(rename = "instruction:queued")]
    InstructionQueued {
        container_id: ContainerId,
        job_id: JobId,
        priority: Priority,
        timestamp_ms: u64,
    },

    #[serde(rename = "instruction:started")]
    InstructionStarted {
        container_id: ContainerId,
        job_id: JobId,
        /// 1-based delivery attempt.
        attempt: u32,
        timestamp_ms: u64,
    },

    #[serde(rename = "instruction:progress")]
    InstructionProgress {
        container_id: ContainerId,
        job_id: JobId,
        percent: u8,
        stage: Stage,
        message: String,
        timestamp_ms: u64,
    },

    #[serde(rename = "instruction:completed")]
    InstructionCompleted {
        container_id: ContainerId,
        job_id: JobId,
        exit_code: i32,
        duration_ms: u64,
        timestamp_ms: u64,
    },

    #[serde(rename = "instruction:failed")]
    InstructionFailed {
        container_id: ContainerId,
        job_id: JobId,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp_ms: u64,
    },

    #[serde(rename = "instruction:dead_lettered")]
    InstructionDeadLettered {
        container_id: ContainerId,
        job_id: JobId,
        error: String,
        attempts: u32,
        timestamp_ms: u64,
    },

    /// Hard-rejected at enqueue (validation or dangerous pattern); never
    /// reached the queue.
    #[serde(rename = "instruction:rejected")]
    InstructionRejected {
        container_id: ContainerId,
        reason: String,
        timestamp_ms: u64,
    },

    // -- session --
    #[serde(rename = "session:started")]
    SessionStarted {
        container_id: ContainerId,
        timestamp_ms: u64,
    },

    #[serde(rename = "session:stopped")]
    SessionStopped {
        container_id: ContainerId,
        timestamp_ms: u64,
    },

    #[serde(rename = "session:error")]
    SessionError {
        container_id: ContainerId,
        error: String,
        timestamp_ms: u64,
    },

    /// One parsed record from the assistant child's stdout stream.
    #[serde(rename = "session:record")]
    AssistantRecord {
        container_id: ContainerId,
        kind: AssistantRecordKind,
        payload: serde_json::Value,
        timestamp_ms: u64,
    },

    /// Periodic progress while waiting for background agents to quiesce.
    #[serde(rename = "session:background_agents")]
    BackgroundAgents {
        container_id: ContainerId,
        agent_count: usize,
        elapsed_ms: u64,
        timestamp_ms: u64,
    },

    /// The quiescence barrier gave up with agents still running.
    #[serde(rename = "session:background_agents_timeout")]
    BackgroundAgentsTimeout {
        container_id: ContainerId,
        agent_count: usize,
        timestamp_ms: u64,
    },

    // -- health --
    #[serde(rename = "health:healthy")]
    HealthHealthy {
        container_id: ContainerId,
        timestamp_ms: u64,
    },

    #[serde(rename = "health:recovering")]
    HealthRecovering {
        container_id: ContainerId,
        /// 1-based recovery attempt.
        attempt: u32,
        error: String,
        timestamp_ms: u64,
    },

    #[serde(rename = "health:recovered")]
    HealthRecovered {
        container_id: ContainerId,
        timestamp_ms: u64,
    },

    #[serde(rename = "health:recovery_failed")]
    HealthRecoveryFailed {
        container_id: ContainerId,
        attempts: u32,
        error: String,
        timestamp_ms: u64,
    },

    // -- container --
    /// The runtime reported the container authoritatively absent.
    #[serde(rename = "container:gone")]
    ContainerGone {
        container_id: ContainerId,
        timestamp_ms: u64,
    },

    /// Catch-all for unknown event types (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

/// Tag-only view of [`Event`] for bus subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstructionQueued,
    InstructionStarted,
    InstructionProgress,
    InstructionCompleted,
    InstructionFailed,
    InstructionDeadLettered,
    InstructionRejected,
    SessionStarted,
    SessionStopped,
    SessionError,
    AssistantRecord,
    BackgroundAgents,
    BackgroundAgentsTimeout,
    HealthHealthy,
    HealthRecovering,
    HealthRecovered,
    HealthRecoveryFailed,
    ContainerGone,
    Custom,
}

crate::simple_display! {
    EventKind {
        InstructionQueued => "instruction:queued",
        InstructionStarted => "instruction:started",
        InstructionProgress => "instruction:progress",
        InstructionCompleted => "instruction:completed",
        InstructionFailed => "instruction:failed",
        InstructionDeadLettered => "instruction:dead_lettered",
        InstructionRejected => "instruction:rejected",
        SessionStarted => "session:started",
        SessionStopped => "session:stopped",
        SessionError => "session:error",
        AssistantRecord => "session:record",
        BackgroundAgents => "session:background_agents",
        BackgroundAgentsTimeout => "session:background_agents_timeout",
        HealthHealthy => "health:healthy",
        HealthRecovering => "health:recovering",
        HealthRecovered => "health:recovered",
        HealthRecoveryFailed => "health:recovery_failed",
        ContainerGone => "container:gone",
        Custom => "custom",
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::InstructionQueued { .. } => EventKind::InstructionQueued,
            Event::InstructionStarted { .. } => EventKind::InstructionStarted,
            Event::InstructionProgress { .. } => EventKind::InstructionProgress,
            Event::InstructionCompleted { .. } => EventKind::InstructionCompleted,
            Event::InstructionFailed { .. } => EventKind::InstructionFailed,
            Event::InstructionDeadLettered { .. } => EventKind::InstructionDeadLettered,
            Event::InstructionRejected { .. } => EventKind::InstructionRejected,
            Event::SessionStarted { .. } => EventKind::SessionStarted,
            Event::SessionStopped { .. } => EventKind::SessionStopped,
            Event::SessionError { .. } => EventKind::SessionError,
            Event::AssistantRecord { .. } => EventKind::AssistantRecord,
            Event::BackgroundAgents { .. } => EventKind::BackgroundAgents,
            Event::BackgroundAgentsTimeout { .. } => EventKind::BackgroundAgentsTimeout,
            Event::HealthHealthy { .. } => EventKind::HealthHealthy,
            Event::HealthRecovering { .. } => EventKind::HealthRecovering,
            Event::HealthRecovered { .. } => EventKind::HealthRecovered,
            Event::HealthRecoveryFailed { .. } => EventKind::HealthRecoveryFailed,
            Event::ContainerGone { .. } => EventKind::ContainerGone,
            Event::Custom => EventKind::Custom,
        }
    }

    pub fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Event::InstructionQueued { container_id, .. }
            | Event::InstructionStarted { container_id, .. }
            | Event::InstructionProgress { container_id, .. }
            | Event::InstructionCompleted { container_id, .. }
            | Event::InstructionFailed { container_id, .. }
            | Event::InstructionDeadLettered { container_id, .. }
            | Event::InstructionRejected { container_id, .. }
            | Event::SessionStarted { container_id, .. }
            | Event::SessionStopped { container_id, .. }
            | Event::SessionError { container_id, .. }
            | Event::AssistantRecord { container_id, .. }
            | Event::BackgroundAgents { container_id, .. }
            | Event::BackgroundAgentsTimeout { container_id, .. }
            | Event::HealthHealthy { container_id, .. }
            | Event::HealthRecovering { container_id, .. }
            | Event::HealthRecovered { container_id, .. }
            | Event::HealthRecoveryFailed { container_id, .. }
            | Event::ContainerGone { container_id, .. } => Some(container_id),
            Event::Custom => None,
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
