// SPDX-License-Identifier: MIT

//! Container log entries and the classification rules.

use crate::container::ContainerId;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which side of the multiplexed stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

crate::simple_display! {
    LogStream {
        Stdout => "stdout",
        Stderr => "stderr",
    }
}

/// Coarse classification for operator filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogClass {
    Build,
    Runtime,
    Info,
    Warning,
    Error,
}

crate::simple_display! {
    LogClass {
        Build => "build",
        Runtime => "runtime",
        Info => "info",
        Warning => "warning",
        Error => "error",
    }
}

/// One sanitized, classified log line persisted by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub container_id: ContainerId,
    pub stream: LogStream,
    pub class: LogClass,
    pub content: String,
    pub recorded_at_ms: u64,
}

/// Compiled classification rules. Applied in order; first match wins:
///
/// 1. `error` — stderr, or error/fail/exception/critical/panic words
/// 2. `warning` — warn/warning/deprecated words
/// 3. `build` — build-tool vocabulary or a `[n/m]` progress prefix
/// 4. `runtime` — whitespace/digits/punctuation only
/// 5. `info` — everything else
pub struct LogClassifier {
    error: Regex,
    warning: Regex,
    build: Regex,
    progress: Regex,
}

impl LogClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            error: Regex::new(r"(?i)\b(error|fail(ed)?|exception|critical|panic)\b")?,
            warning: Regex::new(r"(?i)\b(warn(ing)?|deprecated?)\b")?,
            build: Regex::new(
                r"(?i)\b(npm|pnpm|yarn|webpack|vite|tsc|compil(e|ed|ing)|build(ing)?|bundl(e|ed|ing))\b",
            )?,
            progress: Regex::new(r"^\[?\d+/\d+\]")?,
        })
    }

    pub fn classify(&self, stream: LogStream, content: &str) -> LogClass {
        if stream == LogStream::Stderr || self.error.is_match(content) {
            return LogClass::Error;
        }
        if self.warning.is_match(content) {
            return LogClass::Warning;
        }
        if self.build.is_match(content) || self.progress.is_match(content) {
            return LogClass::Build;
        }
        if content.chars().all(|c| !c.is_alphabetic()) {
            return LogClass::Runtime;
        }
        LogClass::Info
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
