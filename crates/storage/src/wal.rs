// SPDX-License-Identifier: MIT

//! JSONL write-ahead log.
//!
//! Each entry is a single line of JSON: `{"seq":N,"record":{...}}\n`.
//! Appends fsync before returning: every queue mutation is durable when
//! the store call comes back. A corrupt tail (torn write from a crash) is
//! rotated to `.bak` and the valid prefix preserved.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur in Wal operations
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization helper for writing entries without cloning the record.
#[derive(Serialize)]
struct WalRecordRef<'a, T> {
    seq: u64,
    record: &'a T,
}

#[derive(Deserialize)]
struct WalRecord<T> {
    #[allow(dead_code)]
    seq: u64,
    record: T,
}

/// Append-only JSONL log of typed records.
pub struct Wal<T> {
    file: File,
    path: PathBuf,
    /// Next sequence number to assign
    write_seq: u64,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Wal<T> {
    /// Open or create a WAL at the given path and replay every valid
    /// record into `apply`.
    ///
    /// A parse failure mid-file means a torn tail: the file is rotated to
    /// `.bak` and rewritten with only the valid prefix.
    pub fn open(path: &Path, mut apply: impl FnMut(T)) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut valid_lines: Vec<String> = Vec::new();
        let mut write_seq = 0u64;
        let mut corrupt = false;

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalRecord<T>>(&line) {
                    Ok(entry) => {
                        write_seq = write_seq.max(entry.seq);
                        apply(entry.record);
                        valid_lines.push(line);
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            entries = valid_lines.len(),
                            error = %e,
                            "corrupt WAL tail, rotating to .bak and keeping valid prefix",
                        );
                        corrupt = true;
                        break;
                    }
                }
            }
        }

        if corrupt {
            let bak = path.with_extension("wal.bak");
            std::fs::rename(path, &bak)?;
            let mut clean = File::create(path)?;
            for line in &valid_lines {
                clean.write_all(line.as_bytes())?;
                clean.write_all(b"\n")?;
            }
            clean.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self { file, path: path.to_owned(), write_seq, _marker: PhantomData })
    }

    /// Append a record and fsync. Returns the assigned sequence number.
    pub fn append(&mut self, record: &T) -> Result<u64, WalError> {
        self.write_seq += 1;
        let line = serde_json::to_vec(&WalRecordRef { seq: self.write_seq, record })?;
        self.file.write_all(&line)?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        Ok(self.write_seq)
    }

    /// Truncate the log after a snapshot has captured its effects.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        self.file = File::create(&self.path)?;
        self.file.sync_all()?;
        // seq keeps monotonically increasing across truncations
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
