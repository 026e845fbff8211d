// SPDX-License-Identifier: MIT

use super::*;
use yare::parameterized;

fn payload(container: &str) -> JobPayload {
    JobPayload {
        container_id: ContainerId::from_string(container),
        instruction: "echo hello".to_string(),
        mode: SessionMode::Interactive,
        priority: Priority::Interactive,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

#[test]
fn new_job_starts_waiting_with_zero_attempts() {
    let job = InstructionJob::new(payload("c1"), 5_000);
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(job.enqueued_at_ms, 5_000);
    assert!(job.error_stack.is_empty());
    assert!(!job.is_terminal());
}

#[parameterized(
    completed = { JobStatus::Completed, true },
    failed = { JobStatus::Failed, true },
    waiting = { JobStatus::Waiting, false },
    active = { JobStatus::Active, false },
    delayed = { JobStatus::Delayed, false },
    paused = { JobStatus::Paused, false },
)]
fn terminal_statuses(status: JobStatus, terminal: bool) {
    assert_eq!(status.is_terminal(), terminal);
}

#[test]
fn interactive_sorts_before_autonomous() {
    let interactive = InstructionJob::builder()
        .priority(Priority::Interactive)
        .enqueued_at_ms(2_000)
        .build();
    let autonomous = InstructionJob::builder()
        .priority(Priority::Autonomous)
        .enqueued_at_ms(1_000)
        .build();
    // Priority wins over enqueue order.
    assert!(interactive.claim_key() < autonomous.claim_key());
}

#[test]
fn fifo_within_priority() {
    let first = InstructionJob::builder().enqueued_at_ms(1_000).build();
    let second = InstructionJob::builder().enqueued_at_ms(2_000).build();
    assert!(first.claim_key() < second.claim_key());
}

#[test]
fn priority_serializes_as_number() {
    assert_eq!(serde_json::to_string(&Priority::Interactive).unwrap(), "1");
    assert_eq!(serde_json::to_string(&Priority::Autonomous).unwrap(), "2");
    assert_eq!(serde_json::from_str::<Priority>("2").unwrap(), Priority::Autonomous);
    assert!(serde_json::from_str::<Priority>("3").is_err());
}

#[test]
fn attempts_remain_respects_max() {
    let mut job = InstructionJob::builder().max_attempts(2).build();
    assert!(job.attempts_remain());
    job.attempts_made = 1;
    assert!(job.attempts_remain());
    job.attempts_made = 2;
    assert!(!job.attempts_remain());
}

#[test]
fn push_error_keeps_order() {
    let mut job = InstructionJob::builder().build();
    job.push_error("first");
    job.push_error("second");
    assert_eq!(job.error_stack, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn payload_schema_round_trips() {
    let json = r#"{
        "container_id": "0123456789abcdef",
        "instruction": "ls",
        "mode": "autonomous",
        "priority": 2,
        "created_at": "2026-03-01T12:00:00Z"
    }"#;
    let payload: JobPayload = serde_json::from_str(json).unwrap();
    assert_eq!(payload.mode, SessionMode::Autonomous);
    assert_eq!(payload.priority, Priority::Autonomous);
    assert_eq!(payload.container_id.as_str(), "0123456789abcdef");
}
