// SPDX-License-Identifier: MIT

use crate::job::JobId;

#[test]
fn generated_ids_carry_prefix_and_fit_inline() {
    let id = JobId::new();
    assert!(id.as_str().starts_with("job-"));
    assert_eq!(id.as_str().len(), 23);
}

#[test]
fn generated_ids_are_unique() {
    let a = JobId::new();
    let b = JobId::new();
    assert_ne!(a, b);
}

#[test]
fn from_string_round_trips() {
    let id = JobId::from_string("job-abc123");
    assert_eq!(id, "job-abc123");
    assert_eq!(id.as_str(), "job-abc123");
}

#[test]
fn short_strips_prefix_and_truncates() {
    let id = JobId::from_string("job-abcdefgh");
    assert_eq!(id.short(4), "abcd");
    assert_eq!(id.short(99), "abcdefgh");
}

#[test]
fn serde_is_transparent() {
    let id = JobId::from_string("job-xyz");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"job-xyz\"");
    let back: JobId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn oversized_id_fails_deserialization() {
    let long = format!("\"{}\"", "x".repeat(40));
    assert!(serde_json::from_str::<JobId>(&long).is_err());
}
