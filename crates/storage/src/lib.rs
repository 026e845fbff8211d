// SPDX-License-Identifier: MIT

//! Durable stores for the Dockhand orchestrator.
//!
//! Three stores, all file-backed under the daemon's state directory:
//!
//! - [`QueueStore`] — the per-container instruction queue: a JSONL
//!   write-ahead log replayed into materialized state, checkpointed to a
//!   zstd-compressed snapshot.
//! - [`LogStore`] — batched container log entries with rolling retention.
//! - [`UsageStore`] — token/cost records keyed by session bucket.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod logs;
pub mod queue;
pub mod snapshot;
pub mod usage;
pub mod wal;

pub use logs::{LogStore, LOG_RETENTION_MS};
pub use queue::{DeadLetter, FailOutcome, QueueError, QueueStats, QueueStore};
pub use snapshot::SnapshotError;
pub use usage::{UsageError, UsageStore, UsageSummary, WindowTotals, USAGE_RETENTION_MS};
pub use wal::{Wal, WalError};
