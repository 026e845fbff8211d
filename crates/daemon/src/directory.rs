// SPDX-License-Identifier: MIT

//! File-backed view of the external container records.
//!
//! The container-record layer owns `containers.json` and rewrites it as
//! containers are created, started, stopped, and deleted. The daemon
//! only reads; every lookup re-reads the file so external mutations are
//! visible without coordination.

use dh_core::{ContainerDirectory, ContainerId, ContainerRecord};
use std::path::PathBuf;
use tracing::warn;

pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Vec<ContainerRecord> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            // Absent file means no containers yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "container records unreadable");
                return Vec::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "container records unparseable");
                Vec::new()
            }
        }
    }
}

impl ContainerDirectory for FileDirectory {
    fn list(&self) -> Vec<ContainerRecord> {
        self.read()
    }

    fn get(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.read().into_iter().find(|record| &record.id == id)
    }
}

#[cfg(test)]
#[path = "directory_tests.rs"]
mod tests;
