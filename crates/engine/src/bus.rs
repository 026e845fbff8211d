// SPDX-License-Identifier: MIT

//! Typed in-process pub/sub for component events.
//!
//! Publication order is global, so subscribers observe events for any one
//! `(container, kind)` pair in emission order. Each subscription is
//! bounded: a slow subscriber drops its oldest pending events and the
//! drop count is surfaced as a metric instead of blocking publishers.

use dh_core::{ContainerId, Event, EventKind};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Per-subscription queue depth before oldest events are dropped.
const SUBSCRIPTION_DEPTH: usize = 1024;

/// Shared event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIPTION_DEPTH);
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// simply not delivered.
    pub fn publish(&self, event: Event) {
        tracing::trace!(kind = %event.kind(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> Subscription {
        self.filtered(None, None)
    }

    /// Subscribe to all events for one container.
    pub fn subscribe_container(&self, container_id: &ContainerId) -> Subscription {
        self.filtered(Some(container_id.clone()), None)
    }

    /// Subscribe to specific kinds, optionally scoped to a container.
    pub fn subscribe_kinds(
        &self,
        container_id: Option<&ContainerId>,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> Subscription {
        self.filtered(container_id.cloned(), Some(kinds.into_iter().collect()))
    }

    fn filtered(
        &self,
        container: Option<ContainerId>,
        kinds: Option<HashSet<EventKind>>,
    ) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            container,
            kinds,
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events dropped across all lagging subscriptions.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A filtered, bounded event receiver.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    container: Option<ContainerId>,
    kinds: Option<HashSet<EventKind>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if let Some(container) = &self.container {
            if event.container_id() != Some(container) {
                return false;
            }
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }

    /// Next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(lagged = n, "subscription dropped oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking drain of whatever matching events are already queued.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => events.push(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(_) => return events,
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
