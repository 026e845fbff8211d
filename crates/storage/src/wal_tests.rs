// SPDX-License-Identifier: MIT

use super::*;
use serde::{Deserialize, Serialize};
use std::io::Write as _;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Rec {
    n: u32,
}

fn collect_replay(path: &std::path::Path) -> (Wal<Rec>, Vec<Rec>) {
    let mut seen = Vec::new();
    let wal = Wal::open(path, |r| seen.push(r)).unwrap();
    (wal, seen)
}

#[test]
fn append_then_reopen_replays_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let (mut wal, seen) = collect_replay(&path);
    assert!(seen.is_empty());
    for n in 0..5 {
        wal.append(&Rec { n }).unwrap();
    }
    drop(wal);

    let (_, seen) = collect_replay(&path);
    assert_eq!(seen, (0..5).map(|n| Rec { n }).collect::<Vec<_>>());
}

#[test]
fn sequence_numbers_increase() {
    let dir = tempfile::tempdir().unwrap();
    let (mut wal, _) = collect_replay(&dir.path().join("test.wal"));
    let a = wal.append(&Rec { n: 1 }).unwrap();
    let b = wal.append(&Rec { n: 2 }).unwrap();
    assert!(b > a);
}

#[test]
fn corrupt_tail_is_rotated_and_prefix_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let (mut wal, _) = collect_replay(&path);
    wal.append(&Rec { n: 1 }).unwrap();
    wal.append(&Rec { n: 2 }).unwrap();
    drop(wal);

    // Simulate a torn write.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"seq\":3,\"rec").unwrap();
    drop(file);

    let (wal, seen) = collect_replay(&path);
    assert_eq!(seen, vec![Rec { n: 1 }, Rec { n: 2 }]);
    assert!(wal.path().with_extension("wal.bak").exists());

    // The rewritten file replays cleanly.
    drop(wal);
    let (_, seen) = collect_replay(&path);
    assert_eq!(seen.len(), 2);
}

#[test]
fn truncate_clears_entries_but_keeps_seq_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.wal");

    let (mut wal, _) = collect_replay(&path);
    wal.append(&Rec { n: 1 }).unwrap();
    wal.truncate().unwrap();
    let seq = wal.append(&Rec { n: 2 }).unwrap();
    assert_eq!(seq, 2);
    drop(wal);

    let (_, seen) = collect_replay(&path);
    assert_eq!(seen, vec![Rec { n: 2 }]);
}

#[test]
fn blank_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.wal");
    std::fs::write(&path, "{\"seq\":1,\"record\":{\"n\":7}}\n\n").unwrap();

    let (_, seen) = collect_replay(&path);
    assert_eq!(seen, vec![Rec { n: 7 }]);
}
