// SPDX-License-Identifier: MIT

use super::*;

#[test]
fn percent_encode_escapes_filter_json() {
    let encoded = percent_encode(r#"{"type":["container"]}"#);
    assert_eq!(encoded, "%7B%22type%22%3A%5B%22container%22%5D%7D");
}

#[test]
fn percent_encode_passes_unreserved() {
    assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
}

#[test]
fn event_line_parses_container_action() {
    let line = br#"{"Type":"container","Action":"start","Actor":{"ID":"abc123"},"time":1}"#;
    let event = parse_event_line(line).unwrap();
    assert_eq!(event.action, "start");
    assert_eq!(event.handle.as_str(), "abc123");
}

#[test]
fn event_line_accepts_short_id_field() {
    let line = br#"{"Action":"die","id":"deadbeef"}"#;
    let event = parse_event_line(line).unwrap();
    assert_eq!(event.handle.as_str(), "deadbeef");
}

#[test]
fn malformed_event_line_is_skipped() {
    assert!(parse_event_line(b"not json").is_none());
    assert!(parse_event_line(br#"{"Action":7}"#).is_none());
}

#[test]
fn from_env_defaults_are_sane() {
    let runtime = DockerRuntime::from_env();
    // Defaults apply when the env vars are unset; constructing must not panic.
    let _ = runtime.clone();
}
