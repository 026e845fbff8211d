// SPDX-License-Identifier: MIT

//! Persisted container log entries.
//!
//! One JSONL file per container under `logs/`. The collector appends in
//! batches; the retention janitor rewrites each file dropping entries
//! older than the 24-hour window. Entries for one container are appended
//! in recorded-at order, so per-stream order on disk matches emission.

use dh_core::{Clock, ContainerId, LogEntry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use dh_core::{LogClass, LogStream};

/// Rolling retention window for persisted entries (24 hours).
pub const LOG_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

/// File-backed log entry store.
pub struct LogStore<C: Clock> {
    dir: PathBuf,
    clock: C,
    // Serializes append vs prune rewrites.
    lock: Mutex<()>,
}

impl<C: Clock> LogStore<C> {
    pub fn open(dir: &Path, clock: C) -> Result<Self, io::Error> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_owned(), clock, lock: Mutex::new(()) })
    }

    fn file_path(&self, container_id: &ContainerId) -> PathBuf {
        self.dir.join(format!("{container_id}.jsonl"))
    }

    /// Append a batch of entries, grouped per container, one fsync per file.
    pub fn insert_batch(&self, entries: &[LogEntry]) -> Result<(), io::Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();

        let mut by_container: Vec<(&ContainerId, Vec<&LogEntry>)> = Vec::new();
        for entry in entries {
            match by_container.iter_mut().find(|(id, _)| *id == &entry.container_id) {
                Some((_, group)) => group.push(entry),
                None => by_container.push((&entry.container_id, vec![entry])),
            }
        }

        for (container_id, group) in by_container {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_path(container_id))?;
            for entry in group {
                let line = serde_json::to_string(entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                writeln!(file, "{line}")?;
            }
            file.sync_data()?;
        }
        Ok(())
    }

    /// Most recent `limit` entries for a container, oldest first.
    pub fn query(&self, container_id: &ContainerId, limit: usize) -> Vec<LogEntry> {
        let _guard = self.lock.lock();
        let mut entries = read_entries(&self.file_path(container_id));
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }

    /// Delete entries older than the retention window. Returns how many
    /// were removed across all containers.
    pub fn prune_expired(&self) -> Result<usize, io::Error> {
        let cutoff = self.clock.epoch_ms().saturating_sub(LOG_RETENTION_MS);
        let _guard = self.lock.lock();
        let mut removed = 0;

        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let entries = read_entries(&path);
            let kept: Vec<&LogEntry> =
                entries.iter().filter(|e| e.recorded_at_ms >= cutoff).collect();
            if kept.len() == entries.len() {
                continue;
            }
            removed += entries.len() - kept.len();

            if kept.is_empty() {
                std::fs::remove_file(&path)?;
                continue;
            }
            let tmp = path.with_extension("jsonl.tmp");
            {
                let mut file = File::create(&tmp)?;
                for entry in kept {
                    let line = serde_json::to_string(entry)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    writeln!(file, "{line}")?;
                }
                file.sync_data()?;
            }
            std::fs::rename(&tmp, &path)?;
        }

        if removed > 0 {
            debug!(removed, "log retention pruned entries");
        }
        Ok(removed)
    }
}

fn read_entries(path: &Path) -> Vec<LogEntry> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                // Torn tail from a crash mid-append; keep what parsed.
                warn!(path = %path.display(), error = %e, "skipping corrupt log line");
                break;
            }
        }
    }
    entries
}

#[cfg(test)]
#[path = "logs_tests.rs"]
mod tests;
