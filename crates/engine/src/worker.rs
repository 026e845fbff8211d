// SPDX-License-Identifier: MIT

//! Per-container instruction workers.
//!
//! One worker task per container, concurrency 1. Each claimed job runs
//! the stage machine (validate → ensure session → dispatch → finalize →
//! record usage) with progress persisted on the job and mirrored to the
//! bus. Failures are routed by class: transient ones go back to the
//! queue for backoff retry, unfixable ones are buried immediately.

use crate::accountant::UsageAccountant;
use crate::bus::EventBus;
use crate::config::{ms, SharedConfig};
use crate::session::{DispatchOutcome, SessionManager};
use dh_adapters::ContainerRuntime;
use dh_core::{
    validate_container_id, Clock, ContainerDirectory, ContainerId, ErrorClass, Event, EventKind,
    InstructionError, InstructionJob, InstructionScreen, JobId, JobPayload, JobResult, Progress,
    Stage,
};
use dh_storage::{FailOutcome, QueueStore};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Claim-rate token bucket over a sliding window.
struct RateLimiter {
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    fn new() -> Self {
        Self { stamps: VecDeque::new() }
    }

    /// Delay until a claim is permitted, or `None` when one is available.
    fn acquire_delay(&mut self, now: Instant, max: usize, window: Duration) -> Option<Duration> {
        while self.stamps.front().is_some_and(|t| now.duration_since(*t) >= window) {
            self.stamps.pop_front();
        }
        if self.stamps.len() < max {
            return None;
        }
        self.stamps.front().map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
    }

    fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }
}

/// Manager of all instruction workers.
pub struct WorkerPool<R: ContainerRuntime, C: Clock> {
    /// Self-handle for spawning worker tasks from `&self` methods.
    me: Weak<Self>,
    queue: Arc<QueueStore<C>>,
    sessions: Arc<SessionManager<R, C>>,
    accountant: Arc<UsageAccountant<C>>,
    directory: Arc<dyn ContainerDirectory>,
    bus: EventBus,
    clock: C,
    config: SharedConfig,
    screen: InstructionScreen,
    workers: Mutex<HashMap<ContainerId, CancellationToken>>,
}

impl<R: ContainerRuntime, C: Clock> WorkerPool<R, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore<C>>,
        sessions: Arc<SessionManager<R, C>>,
        accountant: Arc<UsageAccountant<C>>,
        directory: Arc<dyn ContainerDirectory>,
        bus: EventBus,
        clock: C,
        config: SharedConfig,
    ) -> Result<Arc<Self>, regex::Error> {
        let screen = InstructionScreen::new()?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            sessions,
            accountant,
            directory,
            bus,
            clock,
            config,
            screen,
            workers: Mutex::new(HashMap::new()),
        }))
    }

    /// Validate, sanitize, and enqueue an instruction.
    ///
    /// Validation failures never reach the queue: they are rejected here
    /// with an `instruction:rejected` event.
    pub fn submit(&self, payload: JobPayload) -> Result<(JobId, usize), InstructionError> {
        let container_id = payload.container_id.clone();

        let checked = if !validate_container_id(container_id.as_str()) {
            Err(InstructionError::InvalidContainerId(container_id.as_str().to_string()))
        } else {
            self.screen.check(&payload.instruction)
        };

        let instruction = match checked {
            Ok(instruction) => instruction,
            Err(error) => {
                warn!(%container_id, %error, "instruction rejected");
                self.bus.publish(Event::InstructionRejected {
                    container_id,
                    reason: error.to_string(),
                    timestamp_ms: self.clock.epoch_ms(),
                });
                return Err(error);
            }
        };

        let priority = payload.priority;
        let payload = JobPayload { instruction, ..payload };
        let (job_id, waiting) = self
            .queue
            .enqueue(payload)
            .map_err(|e| InstructionError::Transient(e.to_string()))?;

        self.bus.publish(Event::InstructionQueued {
            container_id,
            job_id,
            priority,
            timestamp_ms: self.clock.epoch_ms(),
        });
        Ok((job_id, waiting))
    }

    /// Ensure a worker task exists for a container.
    pub fn ensure(&self, container_id: &ContainerId) {
        let Some(pool) = self.me.upgrade() else { return };
        let mut workers = self.workers.lock();
        if workers.contains_key(container_id) {
            return;
        }
        let cancel = CancellationToken::new();
        workers.insert(container_id.clone(), cancel.clone());

        let container_id = container_id.clone();
        tokio::spawn(async move {
            pool.run_worker(container_id, cancel).await;
        });
    }

    pub fn stop(&self, container_id: &ContainerId) {
        if let Some(cancel) = self.workers.lock().remove(container_id) {
            cancel.cancel();
        }
    }

    pub fn stop_all(&self) {
        for (_, cancel) in self.workers.lock().drain() {
            cancel.cancel();
        }
    }

    pub fn is_running(&self, container_id: &ContainerId) -> bool {
        self.workers.lock().contains_key(container_id)
    }

    async fn run_worker(self: Arc<Self>, container_id: ContainerId, cancel: CancellationToken) {
        info!(%container_id, "instruction worker started");
        let mut limiter = RateLimiter::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let (visibility, poll, rate_max, rate_window) = {
                let config = self.config.read();
                (
                    ms(config.worker.visibility_timeout_ms),
                    ms(config.worker.poll_interval_ms),
                    config.worker.rate_limit_max,
                    ms(config.worker.rate_limit_window_ms),
                )
            };

            if let Some(wait) = limiter.acquire_delay(self.clock.now(), rate_max, rate_window) {
                debug!(%container_id, wait_ms = wait.as_millis() as u64, "claim rate limited");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = cancel.cancelled() => break,
                }
            }

            let job = match self.queue.claim(&container_id, visibility) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(%container_id, error = %e, "queue claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            limiter.record(self.clock.now());
            self.process_job(&container_id, job).await;
        }
        info!(%container_id, "instruction worker stopped");
    }

    async fn process_job(&self, container_id: &ContainerId, job: InstructionJob) {
        let job_id = job.id;
        let attempt = job.attempts_made + 1;
        debug!(%container_id, %job_id, attempt, "processing instruction");

        self.bus.publish(Event::InstructionStarted {
            container_id: container_id.clone(),
            job_id,
            attempt,
            timestamp_ms: self.clock.epoch_ms(),
        });

        // Heartbeat while the job is active so the claim stays visible
        // to us alone.
        let heartbeat_cancel = CancellationToken::new();
        if let Some(pool) = self.me.upgrade() {
            let cancel = heartbeat_cancel.clone();
            tokio::spawn(async move {
                loop {
                    let (interval, visibility) = {
                        let config = pool.config.read();
                        (
                            ms(config.worker.heartbeat_interval_ms),
                            ms(config.worker.visibility_timeout_ms),
                        )
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = pool.queue.heartbeat(job_id, visibility) {
                                debug!(%job_id, error = %e, "heartbeat stopped");
                                return;
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            });
        }

        let result = self.run_stages(container_id, &job).await;
        heartbeat_cancel.cancel();

        match result {
            Ok(outcome) => {
                self.progress(container_id, job_id, 100, Stage::Completed, "instruction completed");
                let job_result = JobResult {
                    exit_code: outcome.exit_code,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    duration_ms: outcome.duration_ms,
                    stdout_truncated: outcome.stdout_truncated,
                    stderr_truncated: outcome.stderr_truncated,
                };
                let duration_ms = job_result.duration_ms;
                let exit_code = job_result.exit_code;
                if let Err(e) = self.queue.finalize(job_id, job_result) {
                    warn!(%job_id, error = %e, "finalize failed");
                }
                info!(%container_id, %job_id, duration_ms, "instruction completed");
                self.bus.publish(Event::InstructionCompleted {
                    container_id: container_id.clone(),
                    job_id,
                    exit_code,
                    duration_ms,
                    timestamp_ms: self.clock.epoch_ms(),
                });
            }
            Err(error) => self.handle_failure(container_id, job_id, attempt, error),
        }
    }

    async fn run_stages(
        &self,
        container_id: &ContainerId,
        job: &InstructionJob,
    ) -> Result<DispatchOutcome, InstructionError> {
        let job_id = job.id;

        // Stage 1: validation (defense in depth; enqueue already screened).
        self.progress(container_id, job_id, 5, Stage::Validating, "validating instruction");
        if !validate_container_id(container_id.as_str()) {
            return Err(InstructionError::InvalidContainerId(container_id.as_str().to_string()));
        }
        let instruction = self.screen.check(&job.instruction)?;
        self.progress(container_id, job_id, 10, Stage::Validating, "instruction validated");

        // Stage 2: session status.
        self.progress(container_id, job_id, 15, Stage::CheckingDaemon, "checking assistant session");
        let session = self.sessions.status(container_id);

        // Stage 3: start the session when absent or not running.
        if session.is_none_or(|s| !s.status.is_healthy()) {
            self.progress(container_id, job_id, 20, Stage::StartingDaemon, "starting assistant session");
            let record = self.directory.get(container_id).ok_or_else(|| {
                InstructionError::Gone(format!("no container record for {container_id}"))
            })?;
            self.sessions
                .ensure_started(container_id, &record.handle, record.mode)
                .await
                .map_err(|e| e.to_instruction_error())?;
            self.wait_session_ready(container_id).await?;
            self.progress(container_id, job_id, 30, Stage::StartingDaemon, "assistant session running");
        }

        // Stage 4: hand off.
        self.progress(container_id, job_id, 35, Stage::SendingInstruction, "sending instruction");
        self.progress(container_id, job_id, 40, Stage::SendingInstruction, "instruction sent");

        // Stage 5: dispatch, refining progress from background-agent events.
        self.progress(container_id, job_id, 45, Stage::Processing, "assistant processing");
        let refine = self.me.upgrade().map(|pool| {
            let container_id = container_id.clone();
            let mut sub = self
                .bus
                .subscribe_kinds(Some(&container_id), [EventKind::BackgroundAgents]);
            tokio::spawn(async move {
                while let Some(Event::BackgroundAgents { agent_count, .. }) = sub.recv().await {
                    pool.progress(
                        &container_id,
                        job_id,
                        55,
                        Stage::Processing,
                        &format!("waiting for {agent_count} background agents"),
                    );
                }
            })
        });
        let dispatched = self.sessions.dispatch(container_id, &instruction).await;
        if let Some(refine) = refine {
            refine.abort();
        }
        let outcome = dispatched.map_err(|e| e.to_instruction_error())?;
        self.progress(container_id, job_id, 55, Stage::Processing, "assistant responded");

        // Stage 6: finalize.
        self.progress(container_id, job_id, 80, Stage::Finalizing, "validating result");
        if outcome.exit_code != 0 {
            return Err(InstructionError::Transient(format!(
                "assistant exited with code {}: {}",
                outcome.exit_code,
                tail(&outcome.stderr, 300),
            )));
        }
        let records = self.accountant.record(container_id, Some(job_id), &outcome.stdout);
        if records > 0 {
            debug!(%container_id, %job_id, records, "usage recorded");
        }
        self.progress(container_id, job_id, 95, Stage::Finalizing, "result recorded");

        Ok(outcome)
    }

    /// Poll the session until RUNNING, bounded by the ready timeout.
    async fn wait_session_ready(&self, container_id: &ContainerId) -> Result<(), InstructionError> {
        let (timeout, poll) = {
            let config = self.config.read();
            (ms(config.worker.ready_timeout_ms), ms(config.worker.ready_poll_ms))
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self
                .sessions
                .status(container_id)
                .is_some_and(|s| s.status.is_healthy())
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InstructionError::NotReady(format!(
                    "session not running within {} ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn handle_failure(
        &self,
        container_id: &ContainerId,
        job_id: JobId,
        attempt: u32,
        error: InstructionError,
    ) {
        let message = format!("attempt {attempt}: {error}");
        warn!(%container_id, %job_id, class = %error.class(), "instruction failed: {message}");

        match error.class() {
            // No retry can fix these; straight to the dead-letter set.
            ErrorClass::Validation | ErrorClass::Gone | ErrorClass::Exhausted => {
                if let Err(e) = self.queue.bury(job_id, &message) {
                    warn!(%job_id, error = %e, "bury failed");
                }
                self.bus.publish(Event::InstructionDeadLettered {
                    container_id: container_id.clone(),
                    job_id,
                    error: message,
                    attempts: attempt,
                    timestamp_ms: self.clock.epoch_ms(),
                });
                if error.class() == ErrorClass::Gone {
                    self.bus.publish(Event::ContainerGone {
                        container_id: container_id.clone(),
                        timestamp_ms: self.clock.epoch_ms(),
                    });
                }
            }
            _ => match self.queue.fail(job_id, &message) {
                Ok(FailOutcome::Retrying { attempt, not_before_ms }) => {
                    debug!(%job_id, attempt, not_before_ms, "retry scheduled");
                    self.bus.publish(Event::InstructionFailed {
                        container_id: container_id.clone(),
                        job_id,
                        error: message,
                        attempt,
                        will_retry: true,
                        timestamp_ms: self.clock.epoch_ms(),
                    });
                }
                Ok(FailOutcome::DeadLettered { attempts }) => {
                    self.bus.publish(Event::InstructionDeadLettered {
                        container_id: container_id.clone(),
                        job_id,
                        error: message,
                        attempts,
                        timestamp_ms: self.clock.epoch_ms(),
                    });
                }
                Err(e) => warn!(%job_id, error = %e, "fail transition rejected"),
            },
        }
    }

    fn progress(
        &self,
        container_id: &ContainerId,
        job_id: JobId,
        percent: u8,
        stage: Stage,
        message: &str,
    ) {
        let progress = Progress {
            percent,
            stage,
            message: message.to_string(),
            updated_at_ms: self.clock.epoch_ms(),
        };
        if let Err(e) = self.queue.update_progress(job_id, progress) {
            debug!(%job_id, error = %e, "progress not persisted");
        }
        self.bus.publish(Event::InstructionProgress {
            container_id: container_id.clone(),
            job_id,
            percent,
            stage,
            message: message.to_string(),
            timestamp_ms: self.clock.epoch_ms(),
        });
    }
}

fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
