// SPDX-License-Identifier: MIT

//! Narrow interface to the container runtime.
//!
//! These are all the runtime operations the core needs. Every error is
//! classified as *transient* (retry locally) or *gone* (the container is
//! authoritatively absent; stop operating on the handle).

pub(crate) mod http;

mod docker;
pub use docker::DockerRuntime;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use async_trait::async_trait;
use dh_core::RuntimeHandle;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Errors from runtime operations, split by retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Expected to clear on its own (socket hiccup, EAGAIN-class).
    #[error("transient runtime failure: {0}")]
    Transient(String),

    /// The container is authoritatively absent (404-class). Callers stop
    /// operating on the handle.
    #[error("container gone: {0}")]
    Gone(String),
}

impl RuntimeError {
    pub fn is_gone(&self) -> bool {
        matches!(self, RuntimeError::Gone(_))
    }
}

/// Result of `inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectInfo {
    pub running: bool,
    /// Exit code of the last run, when the container is stopped.
    pub exit_code: Option<i32>,
}

/// Resource fields the core may push back to the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub memory_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
}

/// Exit of an exec'd process: code plus the terminating signal, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

/// A process running inside a container.
///
/// `stdout` is expected to be newline-delimited JSON for assistant
/// dispatches; `stderr` is free-form text. Cancelling the token kills the
/// process and resolves `exit`.
pub struct ExecProcess {
    pub stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    pub exit: oneshot::Receiver<ExitStatus>,
    pub cancel: CancellationToken,
}

/// Raw bytes from a streaming runtime endpoint. Ends on stream close;
/// an `Err` item reports the failure that closed it.
pub type ByteStream = mpsc::Receiver<Result<Vec<u8>, RuntimeError>>;

/// A container lifecycle event from the runtime's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// `start`, `stop`, or `die`.
    pub action: String,
    pub handle: RuntimeHandle,
}

pub type RuntimeEventStream = mpsc::Receiver<RuntimeEvent>;

/// The contract the engine holds against the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Current state of a container.
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InspectInfo, RuntimeError>;

    /// Start a process inside the container with piped stdio.
    async fn exec(
        &self,
        handle: &RuntimeHandle,
        argv: &[String],
        working_dir: &str,
    ) -> Result<ExecProcess, RuntimeError>;

    /// Attach to the container's multiplexed log stream.
    ///
    /// `since_epoch_secs` bounds the backlog; `follow` keeps the stream
    /// open for new output.
    async fn attach_logs(
        &self,
        handle: &RuntimeHandle,
        since_epoch_secs: u64,
        follow: bool,
    ) -> Result<ByteStream, RuntimeError>;

    /// Container start/stop/die events, as a stream.
    async fn event_stream(&self) -> Result<RuntimeEventStream, RuntimeError>;

    /// Push updated resource limits to a running container.
    async fn update_resources(
        &self,
        handle: &RuntimeHandle,
        patch: ResourcePatch,
    ) -> Result<(), RuntimeError>;

    /// Liveness of the runtime itself.
    async fn ping(&self) -> bool;

    /// Count processes inside the container whose command line matches
    /// `pattern`. Used by the background-agent quiescence barrier.
    async fn list_processes(
        &self,
        handle: &RuntimeHandle,
        pattern: &str,
    ) -> Result<usize, RuntimeError> {
        let argv =
            vec!["pgrep".to_string(), "-f".to_string(), "--".to_string(), pattern.to_string()];
        let mut process = self.exec(handle, &argv, "/").await?;

        let mut stdout = String::new();
        process
            .stdout
            .read_to_string(&mut stdout)
            .await
            .map_err(|e| RuntimeError::Transient(format!("pgrep read failed: {e}")))?;
        // pgrep exits 1 with no output when nothing matches; treat any
        // non-spawn failure the same.
        let _ = tokio::time::timeout(Duration::from_secs(10), process.exit).await;
        Ok(stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }
}
