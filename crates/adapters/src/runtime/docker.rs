// SPDX-License-Identifier: MIT

//! Docker implementation of the runtime contract.
//!
//! Control and stream endpoints go straight to the Engine API over the
//! Unix socket; process execution shells out to the `docker` CLI with
//! piped stdio. Containers are expected to run without a TTY so the log
//! endpoint serves the 8-byte-header multiplexed stream.

use super::http;
use super::{
    ByteStream, ContainerRuntime, ExecProcess, ExitStatus, InspectInfo, ResourcePatch,
    RuntimeError, RuntimeEvent, RuntimeEventStream,
};
use async_trait::async_trait;
use dh_core::RuntimeHandle;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_SOCK: &str = "/var/run/docker.sock";

/// Runtime adapter backed by a local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    sock: PathBuf,
    docker_bin: String,
}

impl DockerRuntime {
    pub fn new(sock: impl Into<PathBuf>, docker_bin: impl Into<String>) -> Self {
        Self { sock: sock.into(), docker_bin: docker_bin.into() }
    }

    /// Socket and binary from `DH_DOCKER_SOCK` / `DH_DOCKER_BIN`, with
    /// conventional defaults.
    pub fn from_env() -> Self {
        let sock = std::env::var("DH_DOCKER_SOCK").unwrap_or_else(|_| DEFAULT_SOCK.to_string());
        let bin = std::env::var("DH_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        Self::new(sock, bin)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InspectInfo, RuntimeError> {
        let path = format!("/containers/{handle}/json");
        let body = http::request(&self.sock, "GET", &path, None).await?.ok("inspect")?;
        let json: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| RuntimeError::Transient(format!("inspect parse: {e}")))?;

        let state = &json["State"];
        Ok(InspectInfo {
            running: state["Running"].as_bool().unwrap_or(false),
            exit_code: state["ExitCode"].as_i64().map(|c| c as i32),
        })
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        argv: &[String],
        working_dir: &str,
    ) -> Result<ExecProcess, RuntimeError> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("exec")
            .arg("-i")
            .arg("-w")
            .arg(working_dir)
            .arg(handle.as_str())
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%handle, ?argv, working_dir, "exec in container");
        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Transient(format!("docker exec spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::pin(s) as std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Transient("docker exec: no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Transient("docker exec: no stderr pipe".into()))?;

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let waiter_cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = waiter_cancel.cancelled() => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ExitStatus {
                    code: status.code().unwrap_or(-1),
                    signal: unix_signal(&status),
                },
                Err(e) => {
                    warn!(error = %e, "docker exec wait failed");
                    ExitStatus { code: -1, signal: None }
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ExecProcess {
            stdin,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit_rx,
            cancel,
        })
    }

    async fn attach_logs(
        &self,
        handle: &RuntimeHandle,
        since_epoch_secs: u64,
        follow: bool,
    ) -> Result<ByteStream, RuntimeError> {
        let path = format!(
            "/containers/{handle}/logs?stdout=1&stderr=1&timestamps=1&since={since_epoch_secs}&follow={}",
            u8::from(follow)
        );
        http::stream(&self.sock, &path).await
    }

    async fn event_stream(&self) -> Result<RuntimeEventStream, RuntimeError> {
        let filters = r#"{"type":["container"],"event":["start","stop","die"]}"#;
        let path = format!("/events?filters={}", percent_encode(filters));
        let mut bytes = http::stream(&self.sock, &path).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(item) = bytes.recv().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "runtime event stream closed");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if let Some(event) = parse_event_line(&line) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn update_resources(
        &self,
        handle: &RuntimeHandle,
        patch: ResourcePatch,
    ) -> Result<(), RuntimeError> {
        let mut body = serde_json::Map::new();
        if let Some(memory) = patch.memory_bytes {
            body.insert("Memory".to_string(), memory.into());
        }
        if let Some(cpu) = patch.cpu_shares {
            body.insert("CpuShares".to_string(), cpu.into());
        }
        if body.is_empty() {
            return Ok(());
        }

        let path = format!("/containers/{handle}/update");
        let body = serde_json::Value::Object(body).to_string();
        http::request(&self.sock, "POST", &path, Some(&body)).await?.ok("update_resources")?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        matches!(
            http::request(&self.sock, "GET", "/_ping", None).await,
            Ok(response) if (200..=299).contains(&response.status)
        )
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Percent-encode a query value (conservative: everything but unreserved).
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn parse_event_line(line: &[u8]) -> Option<RuntimeEvent> {
    let json: serde_json::Value = serde_json::from_slice(line).ok()?;
    let action = json["Action"].as_str()?.to_string();
    let id = json["Actor"]["ID"].as_str().or_else(|| json["id"].as_str())?;
    Some(RuntimeEvent { action, handle: RuntimeHandle::from_string(id) })
}

#[cfg(test)]
#[path = "docker_tests.rs"]
mod tests;
