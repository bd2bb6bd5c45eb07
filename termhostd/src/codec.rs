//! The NDJSON frame codec (C1). A bidirectional newline-delimited-JSON
//! codec over a reliable byte stream: one JSON value per line in, one JSON
//! value plus exactly one `\n` out.
//!
//! Decoding never terminates the connection -- a malformed line is logged
//! (truncated and redacted) and skipped so the stream can keep going.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use termhost_protocol::IpcRequest;
use tracing::warn;

use crate::consts::MAX_LOGGED_LINE;

lazy_static! {
    static ref SECRET_PATTERN: Regex =
        Regex::new(r"(?i)(token|secret|password|key|auth)\s*[:=]\s*\S+").expect("valid regex");
}

/// Redacts any substring matching `(token|secret|password|key|auth)\s*[:=]\s*\S+`
/// (case-insensitive) to `[REDACTED]`.
pub fn redact(line: &str) -> String {
    SECRET_PATTERN.replace_all(line, "[REDACTED]").into_owned()
}

/// Truncates `line` to at most [`MAX_LOGGED_LINE`] characters for logging.
/// The cap only applies to what gets logged on a decode failure -- it is
/// not a limit on valid frame length.
pub fn truncate_for_log(line: &str) -> String {
    if line.chars().count() <= MAX_LOGGED_LINE {
        return line.to_string();
    }
    line.chars().take(MAX_LOGGED_LINE).collect()
}

/// Accumulates bytes read off a socket and yields complete, trimmed,
/// non-empty lines as they appear.
#[derive(Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        LineDecoder { buf: Vec::new() }
    }

    /// Feeds freshly read bytes in and returns every complete line they
    /// produced, in order. Bytes after the last `\n` stay buffered for the
    /// next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }
}

/// Attempts to decode one line as an [`IpcRequest`]. On failure, logs a
/// warning containing the truncated, redacted offending line and returns
/// `None` -- callers should keep processing subsequent lines.
pub fn decode_request(line: &str) -> Option<IpcRequest> {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(req) => Some(req),
        Err(err) => {
            warn!(
                error = %err,
                line = %redact(&truncate_for_log(line)),
                "failed to decode ipc frame"
            );
            None
        }
    }
}

/// Serializes `value` as one JSON object followed by exactly one `\n`.
pub fn encode_line<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redacts_case_insensitively() {
        let line = r#"{"token: abc123 AUTH=deadbeef"}"#;
        let redacted = redact(line);
        assert!(!redacted.contains("abc123"));
        assert!(!redacted.contains("deadbeef"));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[test]
    fn leaves_unrelated_text_alone() {
        let line = r#"{"id":"a","type":"hello"}"#;
        assert_eq!(redact(line), line);
    }

    #[test]
    fn truncates_long_lines() {
        let line = "x".repeat(500);
        let truncated = truncate_for_log(&line);
        assert_eq!(truncated.chars().count(), MAX_LOGGED_LINE);
    }

    #[test]
    fn short_lines_are_unchanged() {
        assert_eq!(truncate_for_log("short"), "short");
    }

    #[test]
    fn feed_splits_on_newlines_and_buffers_remainder() {
        let mut dec = LineDecoder::new();
        let lines = dec.feed(b"{\"a\":1}\n{\"b\":");
        assert_eq!(lines, vec![r#"{"a":1}"#.to_string()]);

        let lines = dec.feed(b"2}\n");
        assert_eq!(lines, vec![r#"{"b":2}"#.to_string()]);
    }

    #[test]
    fn feed_skips_blank_lines() {
        let mut dec = LineDecoder::new();
        let lines = dec.feed(b"\n  \n{\"a\":1}\n");
        assert_eq!(lines, vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn decode_request_rejects_malformed_json() {
        assert!(decode_request("not json").is_none());
        assert!(decode_request(r#"{"id":"x","type":"hello"}"#).is_some());
    }
}
