// SPDX-License-Identifier: MIT

//! One end-to-end instruction dispatch inside a session.
//!
//! The assistant child runs with piped stdio: a single JSON envelope in,
//! newline-delimited JSON records out. Each parsed record becomes a bus
//! event. After the foreground process exits successfully, a quiescence
//! barrier waits for any background agents it spawned before the
//! dispatch reports completion.

use super::SessionManager;
use crate::config::ms;
use dh_adapters::{ContainerRuntime, ExecProcess, ExitStatus, RuntimeError};
use dh_core::{
    AssistantRecordKind, Clock, ContainerId, ErrorClass, Event, InstructionError, RuntimeHandle,
    SessionStatus, SessionToken,
};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stdout markers indicating the assistant spawned background workers.
const BACKGROUND_MARKERS: &[&str] = &["\"name\":\"Task\"", "run_in_background"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no session for container")]
    NoSession,

    #[error("session is {0}, not running")]
    NotRunning(SessionStatus),

    #[error("dispatch already in flight")]
    Busy,

    #[error("container not running")]
    ContainerNotRunning,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("session state error: {0}")]
    State(String),

    #[error("dispatch I/O failure: {0}")]
    Io(String),

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Map onto the instruction failure taxonomy for the worker.
    pub fn to_instruction_error(&self) -> InstructionError {
        match self {
            DispatchError::NoSession | DispatchError::NotRunning(_) => {
                InstructionError::NotReady(self.to_string())
            }
            DispatchError::ContainerNotRunning => {
                InstructionError::NotReady(self.to_string())
            }
            DispatchError::Busy => InstructionError::Busy,
            DispatchError::Runtime(RuntimeError::Gone(message)) => {
                InstructionError::Gone(message.clone())
            }
            DispatchError::Runtime(RuntimeError::Transient(message)) => {
                InstructionError::Transient(message.clone())
            }
            DispatchError::State(message) | DispatchError::Io(message) => {
                InstructionError::Transient(message.clone())
            }
            DispatchError::Cancelled => InstructionError::Transient(self.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.to_instruction_error().class()
    }
}

/// Captured result of a completed dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// What the stdout reader extracted from the stream.
struct StdoutCapture {
    buffer: String,
    truncated: bool,
    saw_background_marker: bool,
}

impl<R: ContainerRuntime, C: Clock> SessionManager<R, C> {
    /// Send one instruction through the container's session and collect
    /// the result.
    ///
    /// Preconditions: session RUNNING and no dispatch in flight. The
    /// `in_flight` flag is set for the whole dispatch and cleared on
    /// every exit path, including cancellation and runtime failure.
    pub async fn dispatch(
        &self,
        container_id: &ContainerId,
        instruction: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (handle, token, first_dispatch, cancel) = self.begin_dispatch(container_id)?;
        let started = Instant::now();

        let result = self
            .run_dispatch(container_id, &handle, &token, first_dispatch, instruction, &cancel)
            .await;

        // Unblocks the cancel-link task for dispatches that never get
        // cancelled; a no-op for already-exited children.
        cancel.cancel();
        self.finish_dispatch(container_id, &result);

        result.map(|mut outcome| {
            outcome.duration_ms = (started.elapsed().as_millis() as u64).max(1);
            outcome
        })
    }

    /// Claim the session for a dispatch under the slot lock.
    fn begin_dispatch(
        &self,
        container_id: &ContainerId,
    ) -> Result<(RuntimeHandle, SessionToken, bool, CancellationToken), DispatchError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(container_id).ok_or(DispatchError::NoSession)?;

        if slot.session.status != SessionStatus::Running {
            return Err(DispatchError::NotRunning(slot.session.status));
        }
        if slot.session.in_flight {
            return Err(DispatchError::Busy);
        }

        let token = slot
            .session
            .token
            .clone()
            .ok_or_else(|| DispatchError::State("session has no token".to_string()))?;

        slot.session.in_flight = true;
        slot.session
            .transition(SessionStatus::Processing)
            .map_err(|e| DispatchError::State(e.to_string()))?;
        slot.session.touch(self.clock.epoch_ms());

        let cancel = CancellationToken::new();
        slot.dispatch_cancel = Some(cancel.clone());
        let first_dispatch = slot.session.is_first_dispatch();
        Ok((slot.handle.clone(), token, first_dispatch, cancel))
    }

    /// Release the session after a dispatch, on every exit path.
    fn finish_dispatch(
        &self,
        container_id: &ContainerId,
        result: &Result<DispatchOutcome, DispatchError>,
    ) {
        let gone = matches!(result, Err(DispatchError::Runtime(e)) if e.is_gone());
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(container_id) {
                slot.session.in_flight = false;
                slot.dispatch_cancel = None;
                if slot.session.status == SessionStatus::Processing {
                    let _ = slot.session.transition(SessionStatus::Running);
                }
                if result.is_ok() {
                    slot.session.instruction_count += 1;
                }
                slot.session.touch(self.clock.epoch_ms());
            }
        }
        if let Err(DispatchError::Runtime(e)) = result {
            self.publish_session_error(container_id, e);
        }
        if gone {
            self.mark_error(container_id, "container gone during dispatch");
        }
    }

    async fn run_dispatch(
        &self,
        container_id: &ContainerId,
        handle: &RuntimeHandle,
        token: &SessionToken,
        first_dispatch: bool,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (bin, workspace, capture_limit) = {
            let config = self.config.read();
            (
                config.session.assistant_bin.clone(),
                config.session.workspace_dir.clone(),
                config.session.capture_limit_bytes,
            )
        };

        let mut argv: Vec<String> = vec![
            bin.clone(),
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if first_dispatch {
            argv.push("--session-id".to_string());
        } else {
            argv.push("--resume".to_string());
        }
        argv.push(token.to_string());

        debug!(%container_id, first_dispatch, "dispatching instruction");
        let mut process = self.runtime.exec(handle, &argv, &workspace).await?;

        // Kill the child if the session is stopped mid-dispatch.
        let child_cancel = process.cancel.clone();
        let link = cancel.clone();
        tokio::spawn(async move {
            link.cancelled().await;
            child_cancel.cancel();
        });

        self.write_envelope(&mut process, instruction).await?;

        let stdout_task = {
            let bus = self.bus.clone();
            let clock = self.clock.clone();
            let container_id = container_id.clone();
            let stdout = std::mem::replace(&mut process.stdout, Box::pin(tokio::io::empty()));
            tokio::spawn(read_stdout(stdout, bus, clock, container_id, capture_limit))
        };
        let stderr_task = {
            let stderr = std::mem::replace(&mut process.stderr, Box::pin(tokio::io::empty()));
            tokio::spawn(read_capped(stderr, capture_limit))
        };

        let exit = tokio::select! {
            exit = &mut process.exit => exit.unwrap_or(ExitStatus { code: -1, signal: None }),
            _ = cancel.cancelled() => {
                process.cancel.cancel();
                let _ = (&mut process.exit).await;
                // Let the readers observe EOF before tearing down.
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(DispatchError::Cancelled);
            }
        };

        let capture = stdout_task
            .await
            .map_err(|e| DispatchError::Io(format!("stdout reader: {e}")))?;
        let (stderr, stderr_truncated) = stderr_task
            .await
            .map_err(|e| DispatchError::Io(format!("stderr reader: {e}")))?;

        if exit.code == 0 && capture.saw_background_marker {
            self.background_barrier(container_id, handle, &bin, cancel).await?;
        }

        info!(
            %container_id,
            exit_code = exit.code,
            signal = ?exit.signal,
            stdout_bytes = capture.buffer.len(),
            "dispatch child exited"
        );

        Ok(DispatchOutcome {
            exit_code: exit.code,
            stdout: capture.buffer,
            stderr,
            duration_ms: 0, // stamped by the caller
            stdout_truncated: capture.truncated,
            stderr_truncated,
        })
    }

    async fn write_envelope(
        &self,
        process: &mut ExecProcess,
        instruction: &str,
    ) -> Result<(), DispatchError> {
        let envelope = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": instruction },
        });
        let mut stdin = process
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Io("child stdin unavailable".to_string()))?;
        let line = format!("{envelope}\n");
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DispatchError::Io(format!("stdin write: {e}")))?;
        stdin.shutdown().await.map_err(|e| DispatchError::Io(format!("stdin close: {e}")))?;
        Ok(())
    }

    /// Wait for background agents spawned by the foreground process to
    /// exit, polling the runtime and reporting the outstanding count.
    /// Bounded; emits a warning event when the bound is hit.
    async fn background_barrier(
        &self,
        container_id: &ContainerId,
        handle: &RuntimeHandle,
        process_pattern: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let (poll, timeout) = {
            let config = self.config.read();
            (ms(config.session.barrier_poll_ms), ms(config.session.barrier_timeout_ms))
        };
        let started = tokio::time::Instant::now();

        loop {
            let agent_count = match self.runtime.list_processes(handle, process_pattern).await {
                Ok(count) => count,
                Err(e) if e.is_gone() => return Err(e.into()),
                Err(e) => {
                    // Transient poll failure; the next cycle retries.
                    debug!(%container_id, error = %e, "background-agent poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => continue,
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    }
                }
            };
            if agent_count == 0 {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(%container_id, agent_count, "background agents still running at barrier timeout");
                self.bus.publish(Event::BackgroundAgentsTimeout {
                    container_id: container_id.clone(),
                    agent_count,
                    timestamp_ms: self.clock.epoch_ms(),
                });
                return Ok(());
            }

            debug!(%container_id, agent_count, "waiting for background agents");
            self.bus.publish(Event::BackgroundAgents {
                container_id: container_id.clone(),
                agent_count,
                elapsed_ms: elapsed.as_millis() as u64,
                timestamp_ms: self.clock.epoch_ms(),
            });

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            }
        }
    }
}

/// Stream stdout line-by-line: publish a bus event per parsed JSON
/// record, watch for background-agent markers, cap the capture buffer.
async fn read_stdout(
    stdout: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    bus: crate::bus::EventBus,
    clock: impl Clock,
    container_id: ContainerId,
    capture_limit: usize,
) -> StdoutCapture {
    let mut capture = StdoutCapture {
        buffer: String::new(),
        truncated: false,
        saw_background_marker: false,
    };
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stdout stream ended");
                break;
            }
        };

        if BACKGROUND_MARKERS.iter().any(|marker| line.contains(marker)) {
            capture.saw_background_marker = true;
        }

        let (kind, payload) = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(json) => {
                let tag = json.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                (AssistantRecordKind::from_type_tag(tag), json)
            }
            Err(_) => (AssistantRecordKind::System, serde_json::Value::String(line.clone())),
        };
        bus.publish(Event::AssistantRecord {
            container_id: container_id.clone(),
            kind,
            payload,
            timestamp_ms: clock.epoch_ms(),
        });

        if capture.buffer.len() + line.len() + 1 > capture_limit {
            capture.truncated = true;
        } else {
            capture.buffer.push_str(&line);
            capture.buffer.push('\n');
        }
    }
    capture
}

/// Drain a stream into a capped buffer, reporting truncation.
async fn read_capped(
    stream: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    capture_limit: usize,
) -> (String, bool) {
    let mut reader = BufReader::new(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buffer.len() + n > capture_limit {
                    let room = capture_limit.saturating_sub(buffer.len());
                    buffer.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    // Keep draining so the child never blocks on a full pipe.
                } else {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (String::from_utf8_lossy(&buffer).into_owned(), truncated)
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
