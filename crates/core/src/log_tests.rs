// SPDX-License-Identifier: MIT

use super::*;
use yare::parameterized;

fn classifier() -> LogClassifier {
    LogClassifier::new().unwrap()
}

#[test]
fn stderr_always_classifies_as_error() {
    let c = classifier();
    assert_eq!(c.classify(LogStream::Stderr, "everything is fine"), LogClass::Error);
}

#[parameterized(
    error_word = { "Error: connection refused", LogClass::Error },
    failed_word = { "test suite FAILED", LogClass::Error },
    exception = { "unhandled exception in thread", LogClass::Error },
    panic = { "thread 'main' panicked", LogClass::Error },
    warn = { "warn: something odd", LogClass::Warning },
    warning = { "WARNING low disk", LogClass::Warning },
    deprecated = { "fs.exists is deprecated", LogClass::Warning },
    npm = { "npm install react", LogClass::Build },
    vite = { "vite v5.0 building for production", LogClass::Build },
    tsc = { "tsc --noEmit", LogClass::Build },
    progress_prefix = { "[3/7] linking modules", LogClass::Build },
    compile_word = { "compiling main.o", LogClass::Build },
    digits_only = { "12345", LogClass::Runtime },
    punctuation = { "----", LogClass::Runtime },
    blank = { "   ", LogClass::Runtime },
    plain_text = { "server listening on port 3000", LogClass::Info },
)]
fn stdout_classification(content: &str, expected: LogClass) {
    assert_eq!(classifier().classify(LogStream::Stdout, content), expected, "{content:?}");
}

#[test]
fn error_beats_warning_and_build() {
    // First rule wins even when later vocabularies also match.
    let c = classifier();
    assert_eq!(c.classify(LogStream::Stdout, "npm build failed with warning"), LogClass::Error);
}

#[test]
fn warning_beats_build() {
    let c = classifier();
    assert_eq!(c.classify(LogStream::Stdout, "npm warn outdated lockfile"), LogClass::Warning);
}

#[test]
fn entry_serde_round_trip() {
    let entry = LogEntry {
        container_id: ContainerId::from_string("c1"),
        stream: LogStream::Stdout,
        class: LogClass::Info,
        content: "hello".to_string(),
        recorded_at_ms: 123,
    };
    let json = serde_json::to_string(&entry).unwrap();
    assert!(json.contains("\"stdout\""));
    assert_eq!(serde_json::from_str::<LogEntry>(&json).unwrap(), entry);
}
