// SPDX-License-Identifier: MIT

//! Continuous container log collection.
//!
//! One attachment per running container: the multiplexed byte stream is
//! decoded into frames, split into lines, timestamped, sanitized,
//! classified, and batch-inserted into the log store. Attachments follow
//! the runtime's container events (start/stop/die), reconnect on stream
//! failure with a bounded retry, and a janitor enforces the rolling
//! retention window.

use crate::config::{ms, SharedConfig};
use dh_adapters::{ContainerRuntime, FrameDecoder, PayloadParser};
use dh_core::{
    Clock, ContainerDirectory, ContainerId, ContainerStatus, LogClassifier, LogEntry,
    RuntimeHandle,
};
use dh_storage::LogStore;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sliding-window size for the per-second ingest rate (60 samples).
const RATE_SAMPLES: usize = 60;

/// Point-in-time collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectorStats {
    pub attached: usize,
    pub total_entries: u64,
    /// Entries dropped after persistent insert failure.
    pub dropped_entries: u64,
    pub entries_per_second: f64,
    pub last_cleanup_ms: u64,
}

#[derive(Default)]
struct StatsInner {
    total_entries: u64,
    dropped_entries: u64,
    /// (epoch second, entries recorded in that second)
    samples: VecDeque<(u64, u64)>,
    last_cleanup_ms: u64,
}

impl StatsInner {
    fn record(&mut self, now_ms: u64, count: u64) {
        self.total_entries += count;
        let second = now_ms / 1000;
        match self.samples.back_mut() {
            Some((s, n)) if *s == second => *n += count,
            _ => {
                self.samples.push_back((second, count));
                if self.samples.len() > RATE_SAMPLES {
                    self.samples.pop_front();
                }
            }
        }
    }

    fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, n)| n).sum();
        total as f64 / self.samples.len() as f64
    }
}

pub struct LogCollector<R: ContainerRuntime, C: Clock> {
    /// Self-handle for spawning attachment tasks from `&self` methods.
    me: Weak<Self>,
    runtime: Arc<R>,
    store: Arc<LogStore<C>>,
    directory: Arc<dyn ContainerDirectory>,
    clock: C,
    config: SharedConfig,
    parser: Arc<PayloadParser>,
    classifier: Arc<LogClassifier>,
    attachments: Mutex<HashMap<ContainerId, CancellationToken>>,
    stats: Mutex<StatsInner>,
}

impl<R: ContainerRuntime, C: Clock> LogCollector<R, C> {
    pub fn new(
        runtime: Arc<R>,
        store: Arc<LogStore<C>>,
        directory: Arc<dyn ContainerDirectory>,
        clock: C,
        config: SharedConfig,
    ) -> Result<Arc<Self>, regex::Error> {
        let parser = Arc::new(PayloadParser::new()?);
        let classifier = Arc::new(LogClassifier::new()?);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            store,
            directory,
            clock,
            config,
            parser,
            classifier,
            attachments: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
        }))
    }

    /// Attach to all running containers and begin following runtime
    /// container events plus the retention janitor.
    pub fn start(&self, shutdown: CancellationToken) {
        for record in self.directory.list() {
            if record.status == ContainerStatus::Running {
                self.attach(&record.id, &record.handle);
            }
        }

        let Some(collector) = self.me.upgrade() else { return };
        let events_shutdown = shutdown.clone();
        let events_collector = Arc::clone(&collector);
        tokio::spawn(async move {
            events_collector.follow_runtime_events(events_shutdown).await;
        });
        tokio::spawn(async move {
            collector.run_janitor(shutdown).await;
        });
    }

    /// Attach to one container's log stream. Idempotent.
    pub fn attach(&self, container_id: &ContainerId, handle: &RuntimeHandle) {
        let Some(collector) = self.me.upgrade() else { return };
        let mut attachments = self.attachments.lock();
        if attachments.contains_key(container_id) {
            return;
        }
        let cancel = CancellationToken::new();
        attachments.insert(container_id.clone(), cancel.clone());

        info!(%container_id, "log attachment started");
        let container_id = container_id.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            collector.run_attachment(container_id, handle, cancel).await;
        });
    }

    pub fn detach(&self, container_id: &ContainerId) {
        if let Some(cancel) = self.attachments.lock().remove(container_id) {
            debug!(%container_id, "log attachment detached");
            cancel.cancel();
        }
    }

    pub fn detach_all(&self) {
        for (_, cancel) in self.attachments.lock().drain() {
            cancel.cancel();
        }
    }

    pub fn is_attached(&self, container_id: &ContainerId) -> bool {
        self.attachments.lock().contains_key(container_id)
    }

    pub fn stats(&self) -> CollectorStats {
        let inner = self.stats.lock();
        CollectorStats {
            attached: self.attachments.lock().len(),
            total_entries: inner.total_entries,
            dropped_entries: inner.dropped_entries,
            entries_per_second: inner.rate(),
            last_cleanup_ms: inner.last_cleanup_ms,
        }
    }

    /// Follow container start/stop/die from the runtime, keeping the
    /// attachment set in sync. The event stream itself reconnects on the
    /// same bounded schedule as log attachments.
    async fn follow_runtime_events(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let mut events = match self.runtime.event_stream().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "runtime event stream unavailable");
                    let delay = ms(self.config.read().collector.reconnect_delay_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.cancelled() => return,
                    }
                }
            };

            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.cancelled() => return,
                };
                let Some(event) = event else { break };

                let record = self
                    .directory
                    .list()
                    .into_iter()
                    .find(|record| record.handle == event.handle);
                let Some(record) = record else { continue };

                match event.action.as_str() {
                    "start" => self.attach(&record.id, &record.handle),
                    "stop" | "die" => self.detach(&record.id),
                    other => debug!(action = other, "ignoring runtime event"),
                }
            }

            debug!("runtime event stream ended, reconnecting");
            let delay = ms(self.config.read().collector.reconnect_delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn run_janitor(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval = ms(self.config.read().collector.janitor_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.store.prune_expired() {
                Ok(removed) => {
                    if removed > 0 {
                        info!(removed, "log retention janitor pruned entries");
                    }
                    self.stats.lock().last_cleanup_ms = self.clock.epoch_ms();
                }
                Err(e) => warn!(error = %e, "log retention janitor failed"),
            }
        }
    }

    /// Attachment main loop: consume the stream, reconnect on failure
    /// with a bound, give up after consecutive failures.
    async fn run_attachment(
        self: Arc<Self>,
        container_id: ContainerId,
        handle: RuntimeHandle,
        cancel: CancellationToken,
    ) {
        // Initial attach backfills the retention window.
        let mut since_secs =
            (self.clock.epoch_ms() / 1000).saturating_sub(dh_storage::LOG_RETENTION_MS / 1000);
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let (reconnect_delay, max_failures) = {
                let config = self.config.read();
                (ms(config.collector.reconnect_delay_ms), config.collector.max_reconnect_attempts)
            };

            match self.runtime.attach_logs(&handle, since_secs, true).await {
                Err(e) if e.is_gone() => {
                    warn!(%container_id, error = %e, "container gone, ending log attachment");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= max_failures {
                        warn!(%container_id, failures, "giving up on log attachment");
                        break;
                    }
                    debug!(%container_id, error = %e, failures, "log attach failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Ok(stream) => {
                    failures = 0;
                    self.consume_stream(&container_id, stream, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    // Stream ended while the container should still be
                    // running: treat as an error and reconnect.
                    since_secs = self.clock.epoch_ms() / 1000;
                    failures += 1;
                    if failures >= max_failures {
                        warn!(%container_id, failures, "log stream keeps ending, giving up");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        self.attachments.lock().remove(&container_id);
    }

    /// Decode frames and batch entries until the stream ends or the
    /// attachment is cancelled.
    async fn consume_stream(
        &self,
        container_id: &ContainerId,
        mut stream: dh_adapters::ByteStream,
        cancel: &CancellationToken,
    ) {
        let (batch_size, batch_interval) = {
            let config = self.config.read();
            (config.collector.batch_size, ms(config.collector.batch_interval_ms))
        };

        let mut decoder = FrameDecoder::new();
        let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
        // Entries that failed to insert, retried on the next flush.
        let mut backlog: VecDeque<LogEntry> = VecDeque::new();
        let mut ticker = tokio::time::interval(batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = stream.recv() => {
                    match item {
                        Some(Ok(chunk)) => {
                            decoder.push(&chunk);
                            while let Some((frame_stream, payload)) = decoder.next_frame() {
                                let Some(log_stream) = frame_stream.as_log_stream() else {
                                    continue;
                                };
                                for line in dh_adapters::parse_payload(&self.parser, &payload) {
                                    batch.push(LogEntry {
                                        container_id: container_id.clone(),
                                        stream: log_stream,
                                        class: self.classifier.classify(log_stream, &line.content),
                                        recorded_at_ms: line
                                            .recorded_at_ms
                                            .unwrap_or_else(|| self.clock.epoch_ms()),
                                        content: line.content,
                                    });
                                }
                            }
                            if batch.len() >= batch_size {
                                self.flush(&mut batch, &mut backlog, batch_size);
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%container_id, error = %e, "log stream error");
                            self.flush(&mut batch, &mut backlog, batch_size);
                            return;
                        }
                        None => {
                            self.flush(&mut batch, &mut backlog, batch_size);
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch, &mut backlog, batch_size);
                }
                _ = cancel.cancelled() => {
                    self.flush(&mut batch, &mut backlog, batch_size);
                    return;
                }
            }
        }
    }

    /// Insert the pending batch (plus any backlog). On failure the
    /// entries are re-buffered up to 10× batch capacity; overflow drops
    /// the oldest entries and counts them.
    fn flush(&self, batch: &mut Vec<LogEntry>, backlog: &mut VecDeque<LogEntry>, batch_size: usize) {
        if batch.is_empty() && backlog.is_empty() {
            return;
        }
        let mut entries: Vec<LogEntry> = backlog.drain(..).collect();
        entries.append(batch);

        match self.store.insert_batch(&entries) {
            Ok(()) => {
                self.stats.lock().record(self.clock.epoch_ms(), entries.len() as u64);
            }
            Err(e) => {
                warn!(error = %e, pending = entries.len(), "log insert failed, re-buffering");
                backlog.extend(entries);
                let cap = batch_size * 10;
                if backlog.len() > cap {
                    let overflow = backlog.len() - cap;
                    backlog.drain(..overflow);
                    self.stats.lock().dropped_entries += overflow as u64;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "collector_tests.rs"]
mod tests;
