// SPDX-License-Identifier: MIT

//! Raw log payloads to clean lines.
//!
//! Frame payloads arrive as UTF-8 bytes of possibly-partial lines with a
//! leading RFC 3339 nanosecond timestamp (when the runtime stamps them).
//! This module splits, timestamps, and sanitizes; classification happens
//! against the cleaned content.

use chrono::DateTime;
use regex::Regex;

/// One line extracted from a frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Timestamp parsed from the line prefix; `None` means the caller
    /// substitutes wall-clock time.
    pub recorded_at_ms: Option<u64>,
    pub content: String,
}

/// Compiled payload parser.
pub struct PayloadParser {
    timestamp: Regex,
    ansi: Regex,
}

impl PayloadParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            timestamp: Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z)\s?")?,
            // CSI sequences plus OSC strings (terminated by BEL or ST).
            ansi: Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)")?,
        })
    }

    /// Split a payload on LF and clean each line. Blank lines (after
    /// trailing-whitespace strip) are dropped.
    pub fn parse(&self, payload: &str) -> Vec<ParsedLine> {
        payload
            .split('\n')
            .filter_map(|raw| {
                let line = raw.trim_end();
                if line.is_empty() {
                    return None;
                }
                let (recorded_at_ms, rest) = self.extract_timestamp(line);
                Some(ParsedLine { recorded_at_ms, content: self.sanitize(rest) })
            })
            .collect()
    }

    /// Pull the leading RFC 3339-nano timestamp off a line, if present.
    fn extract_timestamp<'a>(&self, line: &'a str) -> (Option<u64>, &'a str) {
        let Some(captures) = self.timestamp.captures(line) else {
            return (None, line);
        };
        let Some(full) = captures.get(0) else {
            return (None, line);
        };
        let stamp = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        match DateTime::parse_from_rfc3339(stamp) {
            Ok(ts) => (Some(ts.timestamp_millis().max(0) as u64), &line[full.end()..]),
            Err(_) => (None, line),
        }
    }

    /// Strip ANSI escapes and control characters except LF and TAB.
    fn sanitize(&self, content: &str) -> String {
        let stripped = self.ansi.replace_all(content, "");
        stripped.chars().filter(|c| !c.is_control() || *c == '\n' || *c == '\t').collect()
    }
}

/// Convenience wrapper for one-off payload parsing.
pub fn parse_payload(parser: &PayloadParser, payload: &[u8]) -> Vec<ParsedLine> {
    parser.parse(&String::from_utf8_lossy(payload))
}

/// Sanitize a single content string with a throwaway parser. Intended
/// for tests; hot paths hold a [`PayloadParser`].
pub fn sanitize_content(content: &str) -> String {
    match PayloadParser::new() {
        Ok(parser) => parser.sanitize(content),
        Err(_) => content.to_string(),
    }
}

#[cfg(test)]
#[path = "log_entry_tests.rs"]
mod tests;
