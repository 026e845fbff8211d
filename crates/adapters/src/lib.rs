// SPDX-License-Identifier: MIT

//! Adapters to the world outside the orchestration core.
//!
//! The [`ContainerRuntime`] trait is the narrow contract the engine holds
//! against the container runtime; [`runtime::DockerRuntime`] implements
//! it over the Docker Engine API (Unix-socket HTTP) plus the `docker`
//! CLI for process execution. The multiplex frame codec and the log-line
//! parser handle the runtime's raw log stream, and the notify adapter
//! carries operator alerts.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod frame;
pub mod log_entry;
pub mod notify;
pub mod runtime;

pub use frame::{encode_frame, FrameDecoder, FrameStream};
pub use log_entry::{parse_payload, sanitize_content, ParsedLine, PayloadParser};
pub use notify::{DesktopNotifyAdapter, NoopNotifyAdapter, NotifyAdapter, NotifyError};
pub use runtime::{
    ByteStream, ContainerRuntime, DockerRuntime, ExecProcess, ExitStatus, InspectInfo,
    ResourcePatch, RuntimeError, RuntimeEvent, RuntimeEventStream,
};

#[cfg(any(test, feature = "test-support"))]
pub use notify::{FakeNotifyAdapter, NotifyCall};
#[cfg(any(test, feature = "test-support"))]
pub use runtime::fake::{ExecCall, ExecPlan, FakeRuntime};
