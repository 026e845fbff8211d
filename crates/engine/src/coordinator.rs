// SPDX-License-Identifier: MIT

//! Container lifecycle coordination and the orchestrator root.
//!
//! The coordinator is the only component that touches every other one:
//! it sequences session, health, worker, log, and queue state when a
//! container starts, stops, or is deleted. The [`Orchestrator`] is the
//! root value that owns all components — no module-level singletons;
//! the daemon builds one and tears it down in a defined order.

use crate::accountant::UsageAccountant;
use crate::bus::EventBus;
use crate::collector::LogCollector;
use crate::config::SharedConfig;
use crate::health::HealthMonitor;
use crate::session::SessionManager;
use crate::worker::WorkerPool;
use dh_adapters::{ContainerRuntime, NotifyAdapter};
use dh_core::{
    Clock, ContainerDirectory, ContainerId, ContainerStatus, Event, EventKind, RuntimeHandle,
};
use dh_storage::{LogStore, QueueError, QueueStore, UsageStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hard bound on waiting out in-flight jobs during `on_stop`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Usage(#[from] dh_storage::UsageError),
    #[error("log store: {0}")]
    Logs(#[from] std::io::Error),
    #[error("pattern compilation: {0}")]
    Regex(#[from] regex::Error),
}

/// Sequences component state across container transitions.
pub struct LifecycleCoordinator<R: ContainerRuntime, C: Clock, N: NotifyAdapter> {
    runtime: Arc<R>,
    sessions: Arc<SessionManager<R, C>>,
    workers: Arc<WorkerPool<R, C>>,
    health: Arc<HealthMonitor<R, C, N>>,
    collector: Arc<LogCollector<R, C>>,
    queue: Arc<QueueStore<C>>,
    directory: Arc<dyn ContainerDirectory>,
    bus: EventBus,
    clock: C,
}

impl<R: ContainerRuntime, C: Clock, N: NotifyAdapter> LifecycleCoordinator<R, C, N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<R>,
        sessions: Arc<SessionManager<R, C>>,
        workers: Arc<WorkerPool<R, C>>,
        health: Arc<HealthMonitor<R, C, N>>,
        collector: Arc<LogCollector<R, C>>,
        queue: Arc<QueueStore<C>>,
        directory: Arc<dyn ContainerDirectory>,
        bus: EventBus,
        clock: C,
    ) -> Self {
        Self { runtime, sessions, workers, health, collector, queue, directory, bus, clock }
    }

    /// Bring every component up for a now-running container. Each step
    /// is non-fatal to the next; failures are published on the bus.
    pub async fn on_start(&self, container_id: &ContainerId, handle: &RuntimeHandle) {
        info!(%container_id, "container lifecycle: start");
        let record = self.directory.get(container_id);
        let mode = record
            .as_ref()
            .map(|record| record.mode)
            .unwrap_or(dh_core::SessionMode::Interactive);

        // Apply the recorded resource limits before any work dispatches.
        if let Some(limits) = record.map(|r| r.limits) {
            let patch = dh_adapters::ResourcePatch {
                memory_bytes: limits.memory_bytes,
                cpu_shares: limits.cpu_shares,
            };
            if let Err(e) = self.runtime.update_resources(handle, patch).await {
                warn!(%container_id, error = %e, "resource limit push failed");
            }
        }

        if let Err(e) = self.sessions.ensure_started(container_id, handle, mode).await {
            warn!(%container_id, error = %e, "session start failed during lifecycle start");
            self.bus.publish(Event::SessionError {
                container_id: container_id.clone(),
                error: e.to_string(),
                timestamp_ms: self.clock.epoch_ms(),
            });
        }
        self.health.start(container_id);
        self.workers.ensure(container_id);
        self.collector.attach(container_id, handle);
        if let Err(e) = self.queue.resume(container_id) {
            warn!(%container_id, error = %e, "queue resume failed");
        }
    }

    /// Wind a container down with a bounded drain of in-flight work.
    /// Anything still active when the bound expires is abandoned; the
    /// claim visibility timeout returns it to the queue for the next
    /// start.
    pub async fn on_stop(&self, container_id: &ContainerId) {
        info!(%container_id, "container lifecycle: stop");
        if let Err(e) = self.queue.pause(container_id) {
            warn!(%container_id, error = %e, "queue pause failed");
        }

        let drained = self.drain_active_jobs(container_id).await;
        if !drained {
            warn!(%container_id, "active job still running at drain deadline, abandoning");
        }

        self.health.stop(container_id);
        self.sessions.stop(container_id).await;
        self.workers.stop(container_id);
        self.collector.detach(container_id);
    }

    /// `on_stop` plus removal of every durable record for the container.
    pub async fn on_delete(&self, container_id: &ContainerId) {
        self.on_stop(container_id).await;
        info!(%container_id, "container lifecycle: delete");
        if let Err(e) = self.queue.destroy(container_id) {
            warn!(%container_id, error = %e, "queue destroy failed");
        }
        self.health.forget(container_id);
        self.sessions.forget(container_id);
    }

    /// Apply `on_start` to every container whose last-known status is
    /// running. Called once at daemon startup.
    pub async fn init_existing(&self) {
        for record in self.directory.list() {
            if record.status == ContainerStatus::Running {
                self.on_start(&record.id, &record.handle).await;
            }
        }
    }

    /// React to `container:gone` by winding the container down.
    pub async fn run_gone_listener(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sub = self.bus.subscribe_kinds(None, [EventKind::ContainerGone]);
        loop {
            let event = tokio::select! {
                event = sub.recv() => event,
                _ = shutdown.cancelled() => return,
            };
            let Some(Event::ContainerGone { container_id, .. }) = event else {
                continue;
            };
            warn!(%container_id, "container gone, stopping its components");
            self.on_stop(&container_id).await;
        }
    }

    /// True once no job is active for the container.
    async fn drain_active_jobs(&self, container_id: &ContainerId) -> bool {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            if self.queue.active_count(container_id) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// Root of the engine: owns every component and the background tasks.
pub struct Orchestrator<R: ContainerRuntime, C: Clock, N: NotifyAdapter> {
    pub bus: EventBus,
    pub config: SharedConfig,
    pub queue: Arc<QueueStore<C>>,
    pub logs: Arc<LogStore<C>>,
    pub usage: Arc<UsageStore<C>>,
    pub sessions: Arc<SessionManager<R, C>>,
    pub workers: Arc<WorkerPool<R, C>>,
    pub health: Arc<HealthMonitor<R, C, N>>,
    pub collector: Arc<LogCollector<R, C>>,
    pub accountant: Arc<UsageAccountant<C>>,
    pub coordinator: Arc<LifecycleCoordinator<R, C, N>>,
    shutdown: CancellationToken,
}

impl<R: ContainerRuntime, C: Clock, N: NotifyAdapter> Orchestrator<R, C, N> {
    /// Build the full component graph over the given adapters and state
    /// directory. Nothing runs until [`Self::start`].
    pub fn new(
        runtime: Arc<R>,
        directory: Arc<dyn ContainerDirectory>,
        notify: N,
        state_dir: &Path,
        config: SharedConfig,
        clock: C,
    ) -> Result<Self, OrchestratorError> {
        let bus = EventBus::new();
        let queue = Arc::new(QueueStore::open(&state_dir.join("queue"), clock.clone())?);
        let logs = Arc::new(LogStore::open(&state_dir.join("logs"), clock.clone())?);
        let usage = Arc::new(UsageStore::open(&state_dir.join("usage"), clock.clone())?);

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&runtime),
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
        ));
        let accountant = Arc::new(UsageAccountant::new(Arc::clone(&usage), clock.clone()));
        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&sessions),
            Arc::clone(&accountant),
            Arc::clone(&directory),
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
        )?;
        let health = HealthMonitor::new(
            Arc::clone(&sessions),
            Arc::clone(&directory),
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
            notify,
        );
        let collector = LogCollector::new(
            Arc::clone(&runtime),
            Arc::clone(&logs),
            Arc::clone(&directory),
            clock.clone(),
            Arc::clone(&config),
        )?;
        let coordinator = Arc::new(LifecycleCoordinator::new(
            Arc::clone(&runtime),
            Arc::clone(&sessions),
            Arc::clone(&workers),
            Arc::clone(&health),
            Arc::clone(&collector),
            Arc::clone(&queue),
            directory,
            bus.clone(),
            clock.clone(),
        ));

        Ok(Self {
            bus,
            config,
            queue,
            logs,
            usage,
            sessions,
            workers,
            health,
            collector,
            accountant,
            coordinator,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start background services and bring up components for every
    /// container already recorded as running.
    pub async fn start(&self) {
        self.collector.start(self.shutdown.clone());
        tokio::spawn(Arc::clone(&self.sessions).run_evictor(self.shutdown.clone()));
        tokio::spawn(Arc::clone(&self.accountant).run_janitor(self.shutdown.clone()));
        tokio::spawn(Arc::clone(&self.coordinator).run_gone_listener(self.shutdown.clone()));
        tokio::spawn(queue_maintenance(Arc::clone(&self.queue), self.shutdown.clone()));
        self.coordinator.init_existing().await;
    }

    /// Tear everything down in a defined order and checkpoint the queue.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.shutdown.cancel();
        self.workers.stop_all();
        self.health.stop_all();
        for session in self.sessions.list() {
            self.sessions.stop(&session.container_id).await;
        }
        self.collector.detach_all();
        if let Err(e) = self.queue.checkpoint() {
            warn!(error = %e, "queue checkpoint on shutdown failed");
        }
    }
}

/// Periodic queue upkeep: the visibility/backoff sweep every minute and
/// a WAL-compacting checkpoint every hour.
async fn queue_maintenance<C: Clock>(queue: Arc<QueueStore<C>>, shutdown: CancellationToken) {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    const CHECKPOINTS_PER_SWEEP: u32 = 60;
    let mut sweeps = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shutdown.cancelled() => return,
        }
        match queue.sweep() {
            Ok(expired) if !expired.is_empty() => {
                warn!(expired = expired.len(), "claims expired without heartbeat");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "queue sweep failed"),
        }
        sweeps += 1;
        if sweeps.is_multiple_of(CHECKPOINTS_PER_SWEEP) {
            if let Err(e) = queue.checkpoint() {
                warn!(error = %e, "queue checkpoint failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
