#![forbid(unsafe_code)]

//! Newline-delimited JSON framing shared by every agent protocol.

use serde_json::Value;

/// A protocol-independent view of one decoded output record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Resumable session token.
    Session(String),
    /// A new logical assistant message begins; the rolling buffer restarts.
    StreamStarted,
    /// Incremental assistant text.
    Delta(String),
    /// A complete assistant message.
    Message(String),
    Model(String),
    Reasoning(String),
    /// The agent reported that the turn failed.
    Error(String),
}

/// Accumulates raw stdout chunks and yields only complete lines.
///
/// Works on bytes so a chunk boundary inside a multi-byte character is safe.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(decode_line)
            .collect()
    }

    /// The unterminated remainder once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = decode_line(&rest);
        (!line.trim().is_empty()).then_some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse one line as a JSON object. Anything else is banner noise.
#[must_use]
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
}

/// String at a `/`-separated JSON pointer, if present and non-empty.
pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = concat!(
        "Starting agent v1.2…\n",
        "{\"type\":\"system\",\"session_id\":\"s-1\"}\n",
        "{\"type\":\"assistant\",\"text\":\"héllo wörld\"}\r\n",
        "\n",
        "not json either\n",
        "{\"type\":\"result\",\"ok\":true}"
    );

    fn parse_all(chunks: &[&[u8]]) -> Vec<Value> {
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(buf.push(chunk));
        }
        lines.extend(buf.finish());
        lines.iter().filter_map(|l| parse_line(l)).collect()
    }

    #[test]
    fn yields_only_complete_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n{\"b\""), vec!["{\"a\":1}".to_owned()]);
        assert_eq!(buf.finish().as_deref(), Some("{\"b\""));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn split_at_any_offset_matches_unsplit_parse() {
        let bytes = OUTPUT.as_bytes();
        let whole = parse_all(&[bytes]);
        assert_eq!(whole.len(), 3);
        for i in 0..=bytes.len() {
            let (a, b) = bytes.split_at(i);
            assert_eq!(parse_all(&[a, b]), whole, "split at byte {i}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_unsplit_parse() {
        let bytes = OUTPUT.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(parse_all(&chunks), parse_all(&[bytes]));
    }

    #[test]
    fn non_object_lines_are_noise() {
        assert!(parse_line("plain text").is_none());
        assert!(parse_line("{broken").is_none());
        assert!(parse_line("[1,2]").is_none());
        assert!(parse_line("  {\"ok\":1}  ").is_some());
    }
}
