// SPDX-License-Identifier: MIT

//! Fake container runtime for deterministic testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{
    ByteStream, ContainerRuntime, ExecProcess, ExitStatus, InspectInfo, ResourcePatch,
    RuntimeError, RuntimeEvent, RuntimeEventStream,
};
use async_trait::async_trait;
use dh_core::RuntimeHandle;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Scripted behavior for one `exec` call. Plans are consumed in order;
/// with no plan queued the exec exits 0 with no output.
#[derive(Debug, Clone, Default)]
pub struct ExecPlan {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wait before emitting output and exiting (simulates a long child).
    pub delay: Duration,
    /// Fail the spawn itself instead of running.
    pub spawn_error: Option<RuntimeError>,
}

impl ExecPlan {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self { stdout: stdout.into(), ..Default::default() }
    }

    pub fn failing(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self { exit_code, stderr: stderr.into(), ..Default::default() }
    }
}

/// Recorded `exec` call. `stdin` fills as the caller writes to the pipe.
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub handle: RuntimeHandle,
    pub argv: Vec<String>,
    pub working_dir: String,
    pub stdin: Arc<Mutex<Vec<u8>>>,
}

struct FakeState {
    containers: HashMap<String, bool>,
    inspect_errors: VecDeque<RuntimeError>,
    exec_plans: VecDeque<ExecPlan>,
    exec_calls: Vec<ExecCall>,
    process_counts: VecDeque<usize>,
    log_chunks: HashMap<String, Vec<Vec<u8>>>,
    attach_errors: VecDeque<RuntimeError>,
    hold_log_streams: bool,
    held_log_txs: Vec<mpsc::Sender<Result<Vec<u8>, RuntimeError>>>,
    event_txs: Vec<mpsc::Sender<RuntimeEvent>>,
    ping_ok: bool,
}

/// Fake runtime with scripted containers, execs, logs, and events.
#[derive(Clone)]
pub struct FakeRuntime {
    inner: Arc<Mutex<FakeState>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                containers: HashMap::new(),
                inspect_errors: VecDeque::new(),
                exec_plans: VecDeque::new(),
                exec_calls: Vec::new(),
                process_counts: VecDeque::new(),
                log_chunks: HashMap::new(),
                attach_errors: VecDeque::new(),
                hold_log_streams: true,
                held_log_txs: Vec::new(),
                event_txs: Vec::new(),
                ping_ok: true,
            })),
        }
    }

    /// Register a container and its running state.
    pub fn set_running(&self, handle: &RuntimeHandle, running: bool) {
        self.inner.lock().containers.insert(handle.to_string(), running);
    }

    pub fn remove_container(&self, handle: &RuntimeHandle) {
        self.inner.lock().containers.remove(handle.as_str());
    }

    /// Queue a scripted response for the next `exec` call.
    pub fn push_exec(&self, plan: ExecPlan) {
        self.inner.lock().exec_plans.push_back(plan);
    }

    /// Inject an error for the next `inspect` call.
    pub fn push_inspect_error(&self, error: RuntimeError) {
        self.inner.lock().inspect_errors.push_back(error);
    }

    /// Queue successive answers for `list_processes`. The last answer
    /// repeats once the queue drains.
    pub fn push_process_counts(&self, counts: &[usize]) {
        self.inner.lock().process_counts.extend(counts.iter().copied());
    }

    /// Script the byte chunks served by `attach_logs` for a container.
    pub fn set_log_chunks(&self, handle: &RuntimeHandle, chunks: Vec<Vec<u8>>) {
        self.inner.lock().log_chunks.insert(handle.to_string(), chunks);
    }

    /// Fail the next `attach_logs` call.
    pub fn push_attach_error(&self, error: RuntimeError) {
        self.inner.lock().attach_errors.push_back(error);
    }

    /// When false, log streams end after their scripted chunks instead of
    /// staying open like a followed stream.
    pub fn set_hold_log_streams(&self, hold: bool) {
        self.inner.lock().hold_log_streams = hold;
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.inner.lock().ping_ok = ok;
    }

    /// Broadcast a runtime event to every open event stream.
    pub async fn emit_event(&self, event: RuntimeEvent) {
        let txs: Vec<_> = self.inner.lock().event_txs.clone();
        for tx in txs {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// All recorded exec calls.
    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.inner.lock().exec_calls.clone()
    }

    pub fn exec_count(&self) -> usize {
        self.inner.lock().exec_calls.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InspectInfo, RuntimeError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.inspect_errors.pop_front() {
            return Err(error);
        }
        match inner.containers.get(handle.as_str()) {
            Some(running) => Ok(InspectInfo { running: *running, exit_code: None }),
            None => Err(RuntimeError::Gone(format!("no such container: {handle}"))),
        }
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        argv: &[String],
        working_dir: &str,
    ) -> Result<ExecProcess, RuntimeError> {
        let stdin_buf = Arc::new(Mutex::new(Vec::new()));
        let plan = {
            let mut inner = self.inner.lock();
            let plan = inner.exec_plans.pop_front().unwrap_or_default();
            if let Some(error) = plan.spawn_error.clone() {
                return Err(error);
            }
            inner.exec_calls.push(ExecCall {
                handle: handle.clone(),
                argv: argv.to_vec(),
                working_dir: working_dir.to_string(),
                stdin: Arc::clone(&stdin_buf),
            });
            plan
        };

        let (stdin_w, mut stdin_r) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut collected = Vec::new();
            let _ = stdin_r.read_to_end(&mut collected).await;
            stdin_buf.lock().extend_from_slice(&collected);
        });

        let (mut stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
        let (mut stderr_w, stderr_r) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        let child_cancel = cancel.clone();
        tokio::spawn(async move {
            let run = async {
                tokio::time::sleep(plan.delay).await;
                let _ = stdout_w.write_all(plan.stdout.as_bytes()).await;
                let _ = stderr_w.write_all(plan.stderr.as_bytes()).await;
                let _ = stdout_w.shutdown().await;
                let _ = stderr_w.shutdown().await;
                ExitStatus { code: plan.exit_code, signal: None }
            };
            let exit = tokio::select! {
                exit = run => exit,
                _ = child_cancel.cancelled() => ExitStatus { code: 137, signal: Some(9) },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ExecProcess {
            stdin: Some(Box::pin(stdin_w)),
            stdout: Box::pin(stdout_r),
            stderr: Box::pin(stderr_r),
            exit: exit_rx,
            cancel,
        })
    }

    async fn attach_logs(
        &self,
        handle: &RuntimeHandle,
        _since_epoch_secs: u64,
        _follow: bool,
    ) -> Result<ByteStream, RuntimeError> {
        let (chunks, hold) = {
            let mut inner = self.inner.lock();
            if let Some(error) = inner.attach_errors.pop_front() {
                return Err(error);
            }
            (
                inner.log_chunks.get(handle.as_str()).cloned().unwrap_or_default(),
                inner.hold_log_streams,
            )
        };

        let (tx, rx) = mpsc::channel(32);
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        if hold {
            self.inner.lock().held_log_txs.push(tx);
        }
        Ok(rx)
    }

    async fn event_stream(&self) -> Result<RuntimeEventStream, RuntimeError> {
        let (tx, rx) = mpsc::channel(32);
        self.inner.lock().event_txs.push(tx);
        Ok(rx)
    }

    async fn update_resources(
        &self,
        handle: &RuntimeHandle,
        _patch: ResourcePatch,
    ) -> Result<(), RuntimeError> {
        if self.inner.lock().containers.contains_key(handle.as_str()) {
            Ok(())
        } else {
            Err(RuntimeError::Gone(format!("no such container: {handle}")))
        }
    }

    async fn ping(&self) -> bool {
        self.inner.lock().ping_ok
    }

    async fn list_processes(
        &self,
        _handle: &RuntimeHandle,
        _pattern: &str,
    ) -> Result<usize, RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.process_counts.len() > 1 {
            Ok(inner.process_counts.pop_front().unwrap_or(0))
        } else {
            Ok(inner.process_counts.front().copied().unwrap_or(0))
        }
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
