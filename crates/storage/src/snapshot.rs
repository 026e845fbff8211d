// SPDX-License-Identifier: MIT

//! zstd-compressed JSON snapshots of store state.
//!
//! A snapshot plus the WAL written after it reconstructs the full state.
//! Writes go through a temp file + rename so a crash mid-checkpoint
//! leaves the previous snapshot intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Compression level for snapshots. Level 3 is the zstd default; queue
/// snapshots are small and written rarely, so ratio beats speed here.
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write `state` to `path` atomically.
pub fn save<T: Serialize>(path: &Path, state: &T) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(state)?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &compressed)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot if one exists. A missing file yields `None`; a
/// corrupt file is treated the same (the WAL replay still recovers
/// everything written since the last good checkpoint).
pub fn load<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let compressed = std::fs::read(path).ok()?;
    let json = match zstd::decode_all(compressed.as_slice()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable snapshot, ignoring");
            return None;
        }
    };
    match serde_json::from_slice(&json) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt snapshot, ignoring");
            None
        }
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
