// SPDX-License-Identifier: MIT

use super::*;
use dh_core::{FakeClock, JobPayload, Priority, SessionMode};
use std::time::Duration;
use yare::parameterized;

const VISIBILITY: Duration = Duration::from_secs(30);

fn store(dir: &std::path::Path) -> (QueueStore<FakeClock>, FakeClock) {
    let clock = FakeClock::new();
    (QueueStore::open(dir, clock.clone()).unwrap(), clock)
}

fn payload(container: &str, priority: Priority) -> JobPayload {
    JobPayload {
        container_id: ContainerId::from_string(container),
        instruction: "echo hello".to_string(),
        mode: SessionMode::Interactive,
        priority,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

fn c(id: &str) -> ContainerId {
    ContainerId::from_string(id)
}

// ── Enqueue / claim ──────────────────────────────────────────────────────────

#[test]
fn enqueue_returns_id_and_waiting_count() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    let (first, waiting) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    assert_eq!(waiting, 1);
    let (second, waiting) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    assert_eq!(waiting, 2);
    assert_ne!(first, second);
}

#[test]
fn claim_respects_priority_then_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (auto_first, _) = store.enqueue(payload("c1", Priority::Autonomous)).unwrap();
    clock.advance(Duration::from_millis(10));
    let (inter_a, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    clock.advance(Duration::from_millis(10));
    let (inter_b, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let job = store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        order.push(job.id);
        store.finalize(job.id, JobResult::default()).unwrap();
    }
    // Interactive (priority 1) ahead of autonomous (priority 2); FIFO within.
    assert_eq!(order, vec![inter_a, inter_b, auto_first]);
}

#[test]
fn claim_marks_active_and_sets_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());
    clock.set_epoch_ms(10_000);

    store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    let job = store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.started_at_ms, Some(10_000));
    assert_eq!(job.visibility_deadline_ms, Some(40_000));
}

#[test]
fn only_one_job_active_per_container() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.enqueue(payload("c1", Priority::Interactive)).unwrap();

    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_some());
    // Second claim must wait for the first to finalize.
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_none());
}

#[test]
fn containers_claim_independently() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.enqueue(payload("c2", Priority::Interactive)).unwrap();

    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_some());
    assert!(store.claim(&c("c2"), VISIBILITY).unwrap().is_some());
}

#[test]
fn claim_empty_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_none());
}

// ── Visibility timeout ───────────────────────────────────────────────────────

#[test]
fn expired_claim_returns_to_waiting_with_attempt_charged() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();

    clock.advance(Duration::from_secs(31));
    let expired = store.sweep().unwrap();
    assert_eq!(expired, vec![job_id]);

    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts_made, 1);

    // Claimable again.
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_some());
}

#[test]
fn heartbeat_extends_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();

    clock.advance(Duration::from_secs(20));
    store.heartbeat(job_id, VISIBILITY).unwrap();
    clock.advance(Duration::from_secs(20));

    assert!(store.sweep().unwrap().is_empty());
    assert_eq!(store.get(job_id).unwrap().status, JobStatus::Active);
}

// ── Failure, backoff, dead letters ───────────────────────────────────────────

#[parameterized(
    first = { 1, 5_000 },
    second = { 2, 10_000 },
    third = { 3, 20_000 },
    fourth = { 4, 40_000 },
    fifth_hits_cap = { 5, 60_000 },
    sixth_stays_capped = { 6, 60_000 },
)]
fn backoff_doubles_until_cap(failures: u32, expected_ms: u64) {
    assert_eq!(backoff_ms(failures), expected_ms);
}

#[test]
fn fail_with_attempts_remaining_delays_for_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());
    clock.set_epoch_ms(100_000);

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();

    let outcome = store.fail(job_id, "session start timed out").unwrap();
    assert_eq!(outcome, FailOutcome::Retrying { attempt: 1, not_before_ms: 105_000 });

    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Delayed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.error_stack.len(), 1);

    // Not claimable until the backoff elapses.
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_none());
    clock.advance(Duration::from_secs(5));
    let again = store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    assert_eq!(again.id, job_id);
}

#[test]
fn second_failure_backs_off_longer() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());
    clock.set_epoch_ms(100_000);

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    store.fail(job_id, "boom").unwrap();
    clock.advance(Duration::from_secs(5));
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();

    let outcome = store.fail(job_id, "boom again").unwrap();
    let FailOutcome::Retrying { attempt, not_before_ms } = outcome else {
        panic!("expected retry, got {outcome:?}");
    };
    assert_eq!(attempt, 2);
    assert_eq!(not_before_ms, clock.epoch_ms() + 10_000);
}

#[test]
fn exhausted_attempts_bury_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    for attempt in 1..=3u32 {
        clock.advance(Duration::from_secs(60));
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        let outcome = store.fail(job_id, "persistent failure").unwrap();
        if attempt < 3 {
            assert!(matches!(outcome, FailOutcome::Retrying { .. }));
        } else {
            assert_eq!(outcome, FailOutcome::DeadLettered { attempts: 3 });
        }
    }

    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.error_stack.len(), 3);

    let letters = store.dead_letters(&c("c1"), 10);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job.id, job_id);

    // Never claimed again automatically.
    clock.advance(Duration::from_secs(600));
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_none());
}

#[test]
fn terminal_jobs_are_write_once() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    store.finalize(job_id, JobResult { exit_code: 0, ..Default::default() }).unwrap();

    assert!(matches!(
        store.finalize(job_id, JobResult::default()),
        Err(QueueError::InvalidState { op: "finalize", .. })
    ));
    assert!(matches!(
        store.fail(job_id, "late failure"),
        Err(QueueError::InvalidState { op: "fail", .. })
    ));
}

// ── Cancel / retry ───────────────────────────────────────────────────────────

#[test]
fn cancel_removes_waiting_and_delayed_only() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    let (waiting_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    assert!(store.cancel(waiting_id).unwrap());
    assert!(store.get(waiting_id).is_none());

    let (active_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    assert!(!store.cancel(active_id).unwrap());

    store.finalize(active_id, JobResult::default()).unwrap();
    assert!(!store.cancel(active_id).unwrap());
}

#[test]
fn retry_requires_failed_and_resets_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    for _ in 0..3 {
        clock.advance(Duration::from_secs(60));
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.fail(job_id, "boom").unwrap();
    }
    assert_eq!(store.get(job_id).unwrap().status, JobStatus::Failed);

    store.retry(job_id).unwrap();
    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts_made, 0);
    assert!(job.failure.is_none());

    // Retry on a non-failed job is rejected.
    assert!(matches!(store.retry(job_id), Err(QueueError::InvalidState { op: "retry", .. })));
}

// ── Pause / resume ───────────────────────────────────────────────────────────

#[test]
fn paused_container_accepts_jobs_but_blocks_claims() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    store.pause(&c("c1")).unwrap();
    store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_none());

    let stats = store.stats(&c("c1"));
    assert_eq!(stats.paused, 1);
    assert_eq!(stats.waiting, 0);

    store.resume(&c("c1")).unwrap();
    assert!(store.claim(&c("c1"), VISIBILITY).unwrap().is_some());
}

#[test]
fn pause_is_idempotent_and_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = store(dir.path());

    store.pause(&c("c1")).unwrap();
    store.pause(&c("c1")).unwrap();
    assert!(store.is_paused(&c("c1")));

    store.enqueue(payload("c2", Priority::Interactive)).unwrap();
    assert!(store.claim(&c("c2"), VISIBILITY).unwrap().is_some());
}

// ── Stats / history ──────────────────────────────────────────────────────────

#[test]
fn stats_count_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (done_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    clock.advance(Duration::from_millis(10));
    store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.enqueue(payload("c2", Priority::Interactive)).unwrap();

    let claimed = store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    assert_eq!(claimed.id, done_id);
    store.finalize(done_id, JobResult::default()).unwrap();

    let stats = store.stats(&c("c1"));
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(store.stats(&c("c2")).waiting, 1);
}

#[test]
fn history_is_newest_first_with_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let mut finished = Vec::new();
    for _ in 0..3 {
        let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.finalize(job_id, JobResult::default()).unwrap();
        finished.push(job_id);
        clock.advance(Duration::from_secs(1));
    }

    let history = store.history(&c("c1"), 2);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, finished[2]);
    assert_eq!(history[1].id, finished[1]);
}

// ── Retention ────────────────────────────────────────────────────────────────

#[test]
fn completed_records_age_out_after_an_hour() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
    store.finalize(job_id, JobResult::default()).unwrap();

    clock.advance(Duration::from_secs(60 * 60 + 1));
    store.sweep().unwrap();
    assert!(store.get(job_id).is_none());
}

#[test]
fn completed_records_cap_at_one_hundred() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let mut ids = Vec::new();
    for _ in 0..105 {
        let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.finalize(job_id, JobResult::default()).unwrap();
        ids.push(job_id);
        clock.advance(Duration::from_millis(10));
    }

    assert_eq!(store.stats(&c("c1")).completed, 100);
    // Oldest five gone, newest kept.
    assert!(store.get(ids[0]).is_none());
    assert!(store.get(ids[104]).is_some());
}

#[test]
fn failed_records_use_the_longer_window() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    for _ in 0..3 {
        clock.advance(Duration::from_secs(60));
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.fail(job_id, "boom").unwrap();
    }

    clock.advance(Duration::from_secs(60 * 60 * 2));
    store.sweep().unwrap();
    // Still inside the 24 h failed-record window.
    assert!(store.get(job_id).is_some());

    clock.advance(Duration::from_secs(60 * 60 * 23));
    store.sweep().unwrap();
    assert!(store.get(job_id).is_none());

    // Dead letters survive retention; only destroy removes them.
    assert_eq!(store.dead_letters(&c("c1"), 10).len(), 1);
}

// ── Destroy / persistence ────────────────────────────────────────────────────

#[test]
fn destroy_drops_jobs_dead_letters_and_pause_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (store, clock) = store(dir.path());

    let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
    for _ in 0..3 {
        clock.advance(Duration::from_secs(60));
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.fail(job_id, "boom").unwrap();
    }
    store.pause(&c("c1")).unwrap();
    store.enqueue(payload("c2", Priority::Interactive)).unwrap();

    store.destroy(&c("c1")).unwrap();
    assert_eq!(store.stats(&c("c1")), QueueStats::default());
    assert!(store.dead_letters(&c("c1"), 10).is_empty());
    assert!(!store.is_paused(&c("c1")));
    // Other containers untouched.
    assert_eq!(store.stats(&c("c2")).waiting, 1);
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();

    let job_id = {
        let store = QueueStore::open(dir.path(), clock.clone()).unwrap();
        let (job_id, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
        store.claim(&c("c1"), VISIBILITY).unwrap().unwrap();
        store.fail(job_id, "boom").unwrap();
        job_id
    };

    let store = QueueStore::open(dir.path(), clock).unwrap();
    let job = store.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Delayed);
    assert_eq!(job.attempts_made, 1);
}

#[test]
fn checkpoint_compacts_wal_without_losing_state() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();

    let (before, after) = {
        let store = QueueStore::open(dir.path(), clock.clone()).unwrap();
        let (before, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
        store.checkpoint().unwrap();
        let (after, _) = store.enqueue(payload("c1", Priority::Interactive)).unwrap();
        (before, after)
    };

    let wal_len = std::fs::metadata(dir.path().join("queue.wal")).unwrap().len();
    assert!(wal_len > 0, "post-checkpoint events stay in the WAL");

    let store = QueueStore::open(dir.path(), clock).unwrap();
    assert!(store.get(before).is_some());
    assert!(store.get(after).is_some());
    assert_eq!(store.stats(&c("c1")).waiting, 2);
}
