// SPDX-License-Identifier: MIT

//! Daemon binary specs
//!
//! Smoke-level checks of the `dhd` binary surface: flag handling and the
//! single-instance lock. Orchestration behavior is covered by the engine
//! crate's tests against the fake runtime.

use assert_cmd::Command;

fn dhd() -> Command {
    #[allow(clippy::unwrap_used)]
    Command::cargo_bin("dhd").unwrap()
}

#[test]
fn version_flag_prints_version() {
    let assert = dhd().arg("--version").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.starts_with("dhd "), "unexpected output: {output}");
}

#[test]
fn help_flag_documents_usage() {
    let assert = dhd().arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.contains("USAGE:"));
    assert!(output.contains("DH_STATE_DIR"));
}

#[test]
fn unknown_argument_fails_with_usage() {
    let assert = dhd().arg("--bogus").assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("unexpected argument"));
}
