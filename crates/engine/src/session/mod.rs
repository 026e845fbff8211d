// SPDX-License-Identifier: MIT

//! Assistant session lifecycle.
//!
//! One session per container, owned by the [`SessionManager`]. Starting
//! is guarded by a per-container single-flight lock so concurrent
//! callers observe exactly one start. Dispatching is strictly serial per
//! session (`in_flight`), parallel across sessions. An idle evictor
//! stops sessions with no activity past the configured timeout.

mod dispatch;

pub use dispatch::{DispatchError, DispatchOutcome};

use crate::bus::EventBus;
use crate::config::{ms, SharedConfig};
use dh_adapters::{ContainerRuntime, RuntimeError};
use dh_core::{
    Clock, ContainerId, Event, RuntimeHandle, Session, SessionMode, SessionStatus, SessionToken,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Slot {
    session: Session,
    handle: RuntimeHandle,
    /// Cancels the in-flight dispatch, when one exists.
    dispatch_cancel: Option<CancellationToken>,
}

/// Owner of all assistant sessions.
pub struct SessionManager<R: ContainerRuntime, C: Clock> {
    runtime: Arc<R>,
    bus: EventBus,
    clock: C,
    config: SharedConfig,
    slots: Mutex<HashMap<ContainerId, Slot>>,
    start_locks: Mutex<HashMap<ContainerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<R: ContainerRuntime, C: Clock> SessionManager<R, C> {
    pub fn new(runtime: Arc<R>, bus: EventBus, clock: C, config: SharedConfig) -> Self {
        Self {
            runtime,
            bus,
            clock,
            config,
            slots: Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    fn start_lock(&self, container_id: &ContainerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock();
        Arc::clone(locks.entry(container_id.clone()).or_default())
    }

    /// Idempotently start (or restart) the session for a container.
    ///
    /// Holds the per-container start lock, so a second caller awaits the
    /// first start and observes its outcome. Fails fast when the runtime
    /// container is not running. The opaque session token is minted on
    /// the first start and survives restarts.
    pub async fn ensure_started(
        &self,
        container_id: &ContainerId,
        handle: &RuntimeHandle,
        mode: SessionMode,
    ) -> Result<Session, DispatchError> {
        let lock = self.start_lock(container_id);
        let _guard = lock.lock().await;

        if let Some(session) = self.status(container_id) {
            if session.status.is_healthy() {
                return Ok(session);
            }
        }

        let info = self.runtime.inspect(handle).await?;
        if !info.running {
            return Err(DispatchError::ContainerNotRunning);
        }

        let now_ms = self.clock.epoch_ms();
        let session = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(container_id.clone()).or_insert_with(|| Slot {
                session: Session::new(container_id.clone(), mode, now_ms),
                handle: handle.clone(),
                dispatch_cancel: None,
            });

            match slot.session.status {
                SessionStatus::Running | SessionStatus::Processing => {
                    return Ok(slot.session.clone())
                }
                SessionStatus::Stopping => {
                    return Err(DispatchError::NotRunning(SessionStatus::Stopping))
                }
                SessionStatus::Stopped | SessionStatus::Error => {
                    slot.session
                        .transition(SessionStatus::Starting)
                        .map_err(|e| DispatchError::State(e.to_string()))?;
                }
                SessionStatus::Starting => {}
            }

            if slot.session.token.is_none() {
                slot.session.token = Some(SessionToken::mint());
            }
            slot.handle = handle.clone();
            slot.session
                .transition(SessionStatus::Running)
                .map_err(|e| DispatchError::State(e.to_string()))?;
            slot.session.touch(now_ms);
            slot.session.clone()
        };

        info!(%container_id, "session started");
        self.bus.publish(Event::SessionStarted {
            container_id: container_id.clone(),
            timestamp_ms: now_ms,
        });
        Ok(session)
    }

    /// Stop a session. Idempotent; safe when no session exists. An
    /// in-flight dispatch is cancelled (its child is signalled).
    pub async fn stop(&self, container_id: &ContainerId) {
        let cancel = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(container_id) else { return };
            if matches!(slot.session.status, SessionStatus::Stopped | SessionStatus::Error) {
                return;
            }
            let cancel = slot.dispatch_cancel.take();
            let _ = slot.session.transition(SessionStatus::Stopping);
            let _ = slot.session.transition(SessionStatus::Stopped);
            slot.session.in_flight = false;
            cancel
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        info!(%container_id, "session stopped");
        self.bus.publish(Event::SessionStopped {
            container_id: container_id.clone(),
            timestamp_ms: self.clock.epoch_ms(),
        });
    }

    /// Drop all session state for a container (lifecycle delete).
    pub fn forget(&self, container_id: &ContainerId) {
        self.slots.lock().remove(container_id);
        self.start_locks.lock().remove(container_id);
    }

    /// Read-only snapshot of one session.
    pub fn status(&self, container_id: &ContainerId) -> Option<Session> {
        self.slots.lock().get(container_id).map(|slot| slot.session.clone())
    }

    /// Read-only snapshots of all sessions.
    pub fn list(&self) -> Vec<Session> {
        self.slots.lock().values().map(|slot| slot.session.clone()).collect()
    }

    /// Mark a session failed (used when the container is gone).
    fn mark_error(&self, container_id: &ContainerId, error: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(container_id) {
            let _ = slot.session.transition(SessionStatus::Error);
            slot.session.error = Some(error.to_string());
        }
    }

    /// Periodic idle eviction. Runs until `shutdown` cancels; a RUNNING
    /// session idle past the timeout is stopped. In-flight dispatches are
    /// never interrupted.
    pub async fn run_evictor(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval = ms(self.config.read().session.evict_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }

            let idle_timeout_ms = self.config.read().session.idle_timeout_ms;
            let now_ms = self.clock.epoch_ms();
            let idle: Vec<ContainerId> = {
                let slots = self.slots.lock();
                slots
                    .values()
                    .filter(|slot| {
                        slot.session.status == SessionStatus::Running
                            && !slot.session.in_flight
                            && slot.session.idle_ms(now_ms) > idle_timeout_ms
                    })
                    .map(|slot| slot.session.container_id.clone())
                    .collect()
            };

            for container_id in idle {
                info!(%container_id, "evicting idle session");
                self.stop(&container_id).await;
            }
        }
    }

    fn publish_session_error(&self, container_id: &ContainerId, error: &RuntimeError) {
        warn!(%container_id, %error, "session runtime failure");
        self.bus.publish(Event::SessionError {
            container_id: container_id.clone(),
            error: error.to_string(),
            timestamp_ms: self.clock.epoch_ms(),
        });
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
