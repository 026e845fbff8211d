// SPDX-License-Identifier: MIT

use crate::test_support::{c1, result_line, Fixture};
use dh_core::{Clock, JobId};

#[tokio::test]
async fn records_usage_from_result_lines() {
    let fx = Fixture::new();
    let stdout = format!(
        "{}\n{}\n{}\n",
        r#"{"type":"assistant","message":{}}"#,
        result_line(100, 50, 0.25),
        "not json",
    );

    let stored = fx.accountant.record(&c1(), Some(JobId::new()), &stdout);
    assert_eq!(stored, 1);

    let summary = fx.accountant.summary(&c1());
    assert_eq!(summary.current_bucket.input_tokens, 100);
    assert_eq!(summary.current_bucket.output_tokens, 50);
    assert_eq!(summary.current_bucket.total_cost_micros, 250_000);
}

#[tokio::test]
async fn zero_usage_results_are_skipped() {
    let fx = Fixture::new();
    let stored = fx.accountant.record(&c1(), Some(JobId::new()), &result_line(0, 0, 0.0));
    assert_eq!(stored, 0);
    assert_eq!(fx.accountant.summary(&c1()).current_bucket.records, 0);
}

#[tokio::test]
async fn non_result_records_are_ignored() {
    let fx = Fixture::new();
    let stdout = concat!(
        r#"{"type":"assistant","usage":{"input_tokens":999,"output_tokens":999}}"#,
        "\n",
        r#"{"type":"tool_result","total_cost_usd":9.9}"#,
        "\n",
    );
    assert_eq!(fx.accountant.record(&c1(), Some(JobId::new()), stdout), 0);
}

#[tokio::test]
async fn reparsing_the_same_stdout_is_idempotent() {
    let fx = Fixture::new();
    let job_id = JobId::new();
    let stdout = result_line(10, 20, 0.01);

    assert_eq!(fx.accountant.record(&c1(), Some(job_id), &stdout), 1);
    // Second pass over identical stdout: uniqueness rejects the insert.
    assert_eq!(fx.accountant.record(&c1(), Some(job_id), &stdout), 0);
    assert_eq!(fx.accountant.summary(&c1()).current_bucket.records, 1);
}

#[tokio::test]
async fn bucket_end_is_reported_for_clients() {
    let fx = Fixture::new();
    fx.accountant.record(&c1(), None, &result_line(1, 1, 0.0));
    let summary = fx.accountant.summary(&c1());
    assert_eq!(summary.bucket_end_ms, dh_core::bucket_end_ms(fx.clock.epoch_ms()));
    assert!(summary.bucket_end_ms > fx.clock.epoch_ms());
}

#[tokio::test]
async fn cost_is_stored_in_micros() {
    let fx = Fixture::new();
    fx.accountant.record(&c1(), None, &result_line(1, 1, 0.000123));
    assert_eq!(fx.accountant.summary(&c1()).current_bucket.total_cost_micros, 123);
}
