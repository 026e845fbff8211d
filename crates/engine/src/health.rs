// SPDX-License-Identifier: MIT

//! Health monitoring with bounded auto-recovery.
//!
//! One probe loop per container. A session is healthy while RUNNING or
//! PROCESSING. Unhealthy probes trigger stop → delay → restart recovery
//! up to the configured attempt cap; past the cap the loop emits
//! `health:recovery_failed`, notifies the operator, and stops itself so
//! a dead container cannot generate an event storm. Operator action
//! (`start`) resumes monitoring.

use crate::bus::EventBus;
use crate::config::{ms, SharedConfig};
use crate::session::SessionManager;
use dh_adapters::{ContainerRuntime, NotifyAdapter};
use dh_core::{Clock, ContainerDirectory, ContainerId, Event, HealthState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HealthMonitor<R: ContainerRuntime, C: Clock, N: NotifyAdapter> {
    /// Self-handle for spawning probe loops from `&self` methods.
    me: Weak<Self>,
    sessions: Arc<SessionManager<R, C>>,
    directory: Arc<dyn ContainerDirectory>,
    bus: EventBus,
    clock: C,
    config: SharedConfig,
    notify: N,
    states: Mutex<HashMap<ContainerId, HealthState>>,
    tasks: Mutex<HashMap<ContainerId, CancellationToken>>,
}

impl<R: ContainerRuntime, C: Clock, N: NotifyAdapter> HealthMonitor<R, C, N> {
    pub fn new(
        sessions: Arc<SessionManager<R, C>>,
        directory: Arc<dyn ContainerDirectory>,
        bus: EventBus,
        clock: C,
        config: SharedConfig,
        notify: N,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sessions,
            directory,
            bus,
            clock,
            config,
            notify,
            states: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Begin (or resume, after exhaustion) monitoring a container.
    pub fn start(&self, container_id: &ContainerId) {
        let Some(monitor) = self.me.upgrade() else { return };
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(container_id) {
            return;
        }
        let cancel = CancellationToken::new();
        tasks.insert(container_id.clone(), cancel.clone());

        // Operator restart clears any exhausted failure streak.
        self.states
            .lock()
            .entry(container_id.clone())
            .and_modify(|s| {
                s.consecutive_failures = 0;
                s.recovering = false;
            })
            .or_insert_with(|| HealthState::new(container_id.clone()));

        let container_id = container_id.clone();
        tokio::spawn(async move {
            monitor.run_probe_loop(container_id, cancel).await;
        });
    }

    pub fn stop(&self, container_id: &ContainerId) {
        if let Some(cancel) = self.tasks.lock().remove(container_id) {
            cancel.cancel();
        }
    }

    pub fn stop_all(&self) {
        for (_, cancel) in self.tasks.lock().drain() {
            cancel.cancel();
        }
    }

    /// Drop all health state for a container (lifecycle delete).
    pub fn forget(&self, container_id: &ContainerId) {
        self.stop(container_id);
        self.states.lock().remove(container_id);
    }

    pub fn is_monitoring(&self, container_id: &ContainerId) -> bool {
        self.tasks.lock().contains_key(container_id)
    }

    pub fn state(&self, container_id: &ContainerId) -> Option<HealthState> {
        self.states.lock().get(container_id).cloned()
    }

    pub fn list(&self) -> Vec<HealthState> {
        self.states.lock().values().cloned().collect()
    }

    async fn run_probe_loop(self: Arc<Self>, container_id: ContainerId, cancel: CancellationToken) {
        info!(%container_id, "health monitoring started");
        loop {
            let interval = ms(self.config.read().health.check_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }

            // Never overlap probes with an in-progress recovery.
            if self.state(&container_id).is_some_and(|s| s.recovering) {
                continue;
            }

            let now_ms = self.clock.epoch_ms();
            let session = self.sessions.status(&container_id);
            let healthy = session.as_ref().is_some_and(|s| s.status.is_healthy());

            if healthy {
                let recovered = {
                    let mut states = self.states.lock();
                    let state = states
                        .entry(container_id.clone())
                        .or_insert_with(|| HealthState::new(container_id.clone()));
                    state.mark_healthy(now_ms)
                };
                if recovered {
                    info!(%container_id, "session healthy again");
                    self.bus.publish(Event::HealthRecovered {
                        container_id: container_id.clone(),
                        timestamp_ms: now_ms,
                    });
                } else {
                    self.bus.publish(Event::HealthHealthy {
                        container_id: container_id.clone(),
                        timestamp_ms: now_ms,
                    });
                }
                continue;
            }

            let reason = session
                .map(|s| format!("session status {}", s.status))
                .unwrap_or_else(|| "no session".to_string());
            let (failures, max_attempts) = {
                let mut states = self.states.lock();
                let state = states
                    .entry(container_id.clone())
                    .or_insert_with(|| HealthState::new(container_id.clone()));
                state.mark_unhealthy(now_ms, &reason);
                (state.consecutive_failures, self.config.read().health.max_recovery_attempts)
            };

            if failures > max_attempts {
                warn!(%container_id, attempts = max_attempts, "recovery exhausted, stopping monitor");
                self.bus.publish(Event::HealthRecoveryFailed {
                    container_id: container_id.clone(),
                    attempts: max_attempts,
                    error: reason.clone(),
                    timestamp_ms: now_ms,
                });
                let _ = self
                    .notify
                    .notify(
                        "Container recovery failed",
                        &format!("{container_id}: {reason} after {max_attempts} recovery attempts"),
                    )
                    .await;
                self.tasks.lock().remove(&container_id);
                break;
            }

            self.attempt_recovery(&container_id, failures, &reason, &cancel).await;
        }
        debug!(%container_id, "health monitoring stopped");
    }

    /// One bounded recovery cycle: stop, wait, restart, verify.
    async fn attempt_recovery(
        &self,
        container_id: &ContainerId,
        attempt: u32,
        reason: &str,
        cancel: &CancellationToken,
    ) {
        self.set_recovering(container_id, true);
        warn!(%container_id, attempt, reason, "attempting session recovery");
        self.bus.publish(Event::HealthRecovering {
            container_id: container_id.clone(),
            attempt,
            error: reason.to_string(),
            timestamp_ms: self.clock.epoch_ms(),
        });

        let recovered = self.recover_once(container_id, cancel).await;

        if recovered {
            let now_ms = self.clock.epoch_ms();
            let mut states = self.states.lock();
            if let Some(state) = states.get_mut(container_id) {
                state.mark_healthy(now_ms);
            }
            drop(states);
            info!(%container_id, attempt, "session recovered");
            self.bus.publish(Event::HealthRecovered {
                container_id: container_id.clone(),
                timestamp_ms: now_ms,
            });
        }
        self.set_recovering(container_id, false);
    }

    async fn recover_once(&self, container_id: &ContainerId, cancel: &CancellationToken) -> bool {
        let (delay, verify_delay) = {
            let config = self.config.read();
            (ms(config.health.recovery_delay_ms), ms(config.health.verify_delay_ms))
        };

        self.sessions.stop(container_id).await;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return false,
        }

        let Some(record) = self.directory.get(container_id) else {
            warn!(%container_id, "no container record for recovery");
            return false;
        };
        if let Err(e) = self
            .sessions
            .ensure_started(container_id, &record.handle, record.mode)
            .await
        {
            warn!(%container_id, error = %e, "recovery restart failed");
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(verify_delay) => {}
            _ = cancel.cancelled() => return false,
        }
        self.sessions.status(container_id).is_some_and(|s| s.status.is_healthy())
    }

    fn set_recovering(&self, container_id: &ContainerId, recovering: bool) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(container_id) {
            state.recovering = recovering;
        }
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
