// SPDX-License-Identifier: MIT

//! Externally-owned container records.
//!
//! Container records are created and mutated by the container-record layer
//! outside the orchestration core; the core only reads them through the
//! [`ContainerDirectory`] contract.

use serde::{Deserialize, Serialize};

/// Stable identifier for a sandbox container.
///
/// Minted by the external container-record layer as either a UUID or a
/// 12–64 character lowercase hex string. The core validates the format at
/// enqueue time ([`crate::validate::validate_container_id`]) and treats the
/// value as opaque everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wrap an identifier that has already been validated (or that comes
    /// from trusted internal state).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an externally-supplied identifier.
    pub fn parse(id: &str) -> Result<Self, crate::error::InstructionError> {
        if crate::validate::validate_container_id(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(crate::error::InstructionError::InvalidContainerId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl std::borrow::Borrow<str> for ContainerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Opaque handle the container runtime uses to address a container.
///
/// Distinct from [`ContainerId`]: the record layer may recreate a container
/// (new handle) while the stable identifier stays the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    pub fn from_string(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuntimeHandle {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// Lifecycle status as recorded by the external container-record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

crate::simple_display! {
    ContainerStatus {
        Creating => "creating",
        Running => "running",
        Stopped => "stopped",
        Error => "error",
    }
}

/// How the assistant session inside the container is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Interactive,
    Autonomous,
}

crate::simple_display! {
    SessionMode {
        Interactive => "interactive",
        Autonomous => "autonomous",
    }
}

/// Resource limits recorded for the container. Read-only to the core;
/// applied through the runtime adapter's `update_resources`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
}

/// A container record as read from the external record layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub handle: RuntimeHandle,
    pub status: ContainerStatus,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub mode: SessionMode,
}

/// Read-only view of the external container records.
///
/// Implementations live outside the core (the daemon ships a file-backed
/// one); the core never mutates records through this trait.
pub trait ContainerDirectory: Send + Sync + 'static {
    /// All known container records.
    fn list(&self) -> Vec<ContainerRecord>;

    /// Look up a single record.
    fn get(&self, id: &ContainerId) -> Option<ContainerRecord>;
}

crate::builder! {
    pub struct ContainerRecordBuilder => ContainerRecord {
        into {
            id: ContainerId = "c1",
            handle: RuntimeHandle = "handle-c1",
        }
        set {
            status: ContainerStatus = ContainerStatus::Running,
            limits: ResourceLimits = ResourceLimits::default(),
            mode: SessionMode = SessionMode::Interactive,
        }
    }
}
