// SPDX-License-Identifier: MIT

//! Shared fixtures for engine tests.

use crate::accountant::UsageAccountant;
use crate::bus::EventBus;
use crate::collector::LogCollector;
use crate::config::{EngineConfig, SharedConfig};
use crate::coordinator::LifecycleCoordinator;
use crate::health::HealthMonitor;
use crate::session::SessionManager;
use crate::worker::WorkerPool;
use dh_adapters::{FakeNotifyAdapter, FakeRuntime};
use dh_core::{
    ContainerDirectory, ContainerId, ContainerRecord, ContainerStatus, FakeClock, JobPayload,
    Priority, ResourceLimits, RuntimeHandle, SessionMode,
};
use dh_storage::{LogStore, QueueStore, UsageStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Container ids must satisfy the hex12-64 format check.
pub const C1: &str = "0123456789ab";
pub const C2: &str = "ba9876543210";

pub fn c1() -> ContainerId {
    ContainerId::from_string(C1)
}

pub fn handle(container: &str) -> RuntimeHandle {
    RuntimeHandle::from_string(format!("handle-{container}"))
}

pub fn payload(container: &str, instruction: &str) -> JobPayload {
    JobPayload {
        container_id: ContainerId::from_string(container),
        instruction: instruction.to_string(),
        mode: SessionMode::Interactive,
        priority: Priority::Interactive,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

/// A `result` stdout line with the given usage numbers.
pub fn result_line(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> String {
    format!(
        r#"{{"type":"result","usage":{{"input_tokens":{input_tokens},"output_tokens":{output_tokens}}},"total_cost_usd":{cost_usd}}}"#
    )
}

/// In-memory container directory.
#[derive(Default)]
pub struct StaticDirectory {
    records: Mutex<HashMap<ContainerId, ContainerRecord>>,
}

impl StaticDirectory {
    pub fn insert(&self, record: ContainerRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    pub fn set_status(&self, id: &ContainerId, status: ContainerStatus) {
        if let Some(record) = self.records.lock().get_mut(id) {
            record.status = status;
        }
    }

    pub fn remove(&self, id: &ContainerId) {
        self.records.lock().remove(id);
    }
}

impl ContainerDirectory for StaticDirectory {
    fn list(&self) -> Vec<ContainerRecord> {
        self.records.lock().values().cloned().collect()
    }

    fn get(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.records.lock().get(id).cloned()
    }
}

/// Fully wired engine over fakes, with `c1` registered and running.
pub struct Fixture {
    pub runtime: FakeRuntime,
    pub clock: FakeClock,
    pub bus: EventBus,
    pub config: SharedConfig,
    pub directory: Arc<StaticDirectory>,
    pub notify: FakeNotifyAdapter,
    pub queue: Arc<QueueStore<FakeClock>>,
    pub logs: Arc<LogStore<FakeClock>>,
    pub usage: Arc<UsageStore<FakeClock>>,
    pub sessions: Arc<SessionManager<FakeRuntime, FakeClock>>,
    pub accountant: Arc<UsageAccountant<FakeClock>>,
    pub workers: Arc<WorkerPool<FakeRuntime, FakeClock>>,
    pub health: Arc<HealthMonitor<FakeRuntime, FakeClock, FakeNotifyAdapter>>,
    pub collector: Arc<LogCollector<FakeRuntime, FakeClock>>,
    pub coordinator: Arc<LifecycleCoordinator<FakeRuntime, FakeClock, FakeNotifyAdapter>>,
    _tmp: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let clock = FakeClock::new();
        clock.set_epoch_ms(100 * 24 * 60 * 60 * 1000);
        let runtime = FakeRuntime::new();
        let bus = EventBus::new();
        let notify = FakeNotifyAdapter::new();
        let config = config.into_shared();

        let directory = Arc::new(StaticDirectory::default());
        directory.insert(ContainerRecord {
            id: c1(),
            handle: handle(C1),
            status: ContainerStatus::Running,
            limits: ResourceLimits::default(),
            mode: SessionMode::Interactive,
        });
        runtime.set_running(&handle(C1), true);

        let queue = Arc::new(QueueStore::open(&tmp.path().join("queue"), clock.clone()).unwrap());
        let logs = Arc::new(LogStore::open(&tmp.path().join("logs"), clock.clone()).unwrap());
        let usage = Arc::new(UsageStore::open(&tmp.path().join("usage"), clock.clone()).unwrap());

        let runtime_arc = Arc::new(runtime.clone());
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&runtime_arc),
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
        ));
        let accountant = Arc::new(UsageAccountant::new(Arc::clone(&usage), clock.clone()));
        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&sessions),
            Arc::clone(&accountant),
            directory.clone() as Arc<dyn ContainerDirectory>,
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
        )
        .unwrap();
        let health = HealthMonitor::new(
            Arc::clone(&sessions),
            directory.clone() as Arc<dyn ContainerDirectory>,
            bus.clone(),
            clock.clone(),
            Arc::clone(&config),
            notify.clone(),
        );
        let collector = LogCollector::new(
            Arc::clone(&runtime_arc),
            Arc::clone(&logs),
            directory.clone() as Arc<dyn ContainerDirectory>,
            clock.clone(),
            Arc::clone(&config),
        )
        .unwrap();
        let coordinator = Arc::new(LifecycleCoordinator::new(
            Arc::clone(&runtime_arc),
            Arc::clone(&sessions),
            Arc::clone(&workers),
            Arc::clone(&health),
            Arc::clone(&collector),
            Arc::clone(&queue),
            directory.clone() as Arc<dyn ContainerDirectory>,
            bus.clone(),
            clock.clone(),
        ));

        Self {
            runtime,
            clock,
            bus,
            config,
            directory,
            notify,
            queue,
            logs,
            usage,
            sessions,
            accountant,
            workers,
            health,
            collector,
            coordinator,
            _tmp: tmp,
        }
    }

    /// Start the `c1` session directly (bypassing the worker).
    pub async fn start_session(&self) {
        self.sessions
            .ensure_started(&c1(), &handle(C1), SessionMode::Interactive)
            .await
            .unwrap();
    }

    /// Keep the fake wall clock moving in step with (paused) tokio time,
    /// so store deadlines (backoff, visibility) progress during tests
    /// that auto-advance timers.
    pub fn drive_clock(&self) -> tokio_util::sync::CancellationToken {
        let cancel = tokio_util::sync::CancellationToken::new();
        let clock = self.clock.clone();
        let guard = cancel.clone();
        tokio::spawn(async move {
            let step = std::time::Duration::from_millis(250);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(step) => clock.advance(step),
                    _ = guard.cancelled() => return,
                }
            }
        });
        cancel
    }
}
