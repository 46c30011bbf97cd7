//! SSE framing
//!
//! The upstream terminates events with `\n\n` or `\r\n\r\n`; bytes arrive on
//! arbitrary chunk boundaries. The parser accumulates and emits complete
//! event blocks only, enforcing a per-event size limit. Legacy event type
//! names are rewritten on the wire before delivery.

use serde_json::Value;

/// Legacy event names rewritten to their current form.
const EVENT_TYPE_ALIASES: &[(&str, &str)] = &[
    ("response.text.delta", "response.output_text.delta"),
    ("response.audio.delta", "response.output_audio.delta"),
    ("response.audio_transcript.delta", "response.output_audio_transcript.delta"),
];

/// A single SSE event grew past the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTooLarge {
    pub size_bytes: usize,
    pub limit_bytes: usize,
}

/// Incremental parser over a byte stream of SSE frames.
#[derive(Debug)]
pub struct SseFraming {
    buffer: Vec<u8>,
    max_event_bytes: usize,
}

impl SseFraming {
    pub fn new(max_event_bytes: usize) -> Self {
        Self { buffer: Vec::new(), max_event_bytes }
    }

    /// Feed a chunk; returns every event block completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, EventTooLarge> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.pop_event()? {
            if !event.trim().is_empty() {
                events.push(event);
            }
        }
        if self.buffer.len() > self.max_event_bytes {
            return Err(EventTooLarge {
                size_bytes: self.buffer.len(),
                limit_bytes: self.max_event_bytes,
            });
        }
        Ok(events)
    }

    /// Whatever is left once the stream ends (an unterminated final block).
    pub fn finish(&mut self) -> Result<Option<String>, EventTooLarge> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        if self.buffer.len() > self.max_event_bytes {
            return Err(EventTooLarge {
                size_bytes: self.buffer.len(),
                limit_bytes: self.max_event_bytes,
            });
        }
        let rest = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        if rest.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(rest))
    }

    fn pop_event(&mut self) -> Result<Option<String>, EventTooLarge> {
        let Some((index, separator_len)) = find_separator(&self.buffer) else {
            return Ok(None);
        };
        let event_end = index + separator_len;
        if event_end > self.max_event_bytes {
            return Err(EventTooLarge {
                size_bytes: event_end,
                limit_bytes: self.max_event_bytes,
            });
        }
        let event = String::from_utf8_lossy(&self.buffer[..event_end]).into_owned();
        self.buffer.drain(..event_end);
        Ok(Some(event))
    }
}

/// Earliest terminator in the buffer, `\r\n\r\n` or `\n\n`.
fn find_separator(buffer: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subslice(buffer, b"\r\n\r\n").map(|idx| (idx, 4));
    let lf = find_subslice(buffer, b"\n\n").map(|idx| (idx, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Serialize a JSON payload as one SSE event block, carrying the payload's
/// `type` on the `event:` line when present.
pub fn format_event(payload: &Value) -> String {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    match payload.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => format!("event: {kind}\ndata: {data}\n\n"),
        _ => format!("data: {data}\n\n"),
    }
}

/// Join the `data:` lines of one event block. Comments are skipped; empty
/// payloads and `[DONE]` yield `None`.
pub fn extract_data(block: &str) -> Option<String> {
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in block.lines() {
        if raw_line.is_empty() || raw_line.starts_with(':') {
            continue;
        }
        let (field, value) = match raw_line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (raw_line, ""),
        };
        if field == "data" {
            data_lines.push(value);
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Rewrite legacy event type names inside an event block, preserving the
/// block's own line separators and terminator.
pub fn normalize_event_block(block: &str) -> String {
    if !EVENT_TYPE_ALIASES
        .iter()
        .any(|(legacy, _)| block.contains(legacy))
    {
        return block.to_string();
    }

    let (body, line_separator, terminator) = if let Some(body) = block.strip_suffix("\r\n\r\n") {
        (body, "\r\n", "\r\n\r\n")
    } else if let Some(body) = block.strip_suffix("\n\n") {
        (body, "\n", "\n\n")
    } else if block.contains("\r\n") {
        (block, "\r\n", "")
    } else {
        (block, "\n", "")
    };

    let mut changed = false;
    let lines: Vec<String> = body
        .lines()
        .map(|line| {
            let normalized = normalize_data_line(line);
            if normalized != line {
                changed = true;
            }
            normalized
        })
        .collect();
    if !changed {
        return block.to_string();
    }
    format!("{}{}", lines.join(line_separator), terminator)
}

fn normalize_data_line(line: &str) -> String {
    let Some(raw) = line.strip_prefix("data:") else {
        return line.to_string();
    };
    let data = raw.trim();
    if data.is_empty() || data == "[DONE]" {
        return line.to_string();
    }
    let Ok(mut payload) = serde_json::from_str::<Value>(data) else {
        return line.to_string();
    };
    let Some(kind) = payload.get("type").and_then(Value::as_str) else {
        return line.to_string();
    };
    let Some((_, replacement)) = EVENT_TYPE_ALIASES.iter().find(|(legacy, _)| *legacy == kind)
    else {
        return line.to_string();
    };
    payload["type"] = Value::String(replacement.to_string());
    match serde_json::to_string(&payload) {
        Ok(serialized) => format!("data: {serialized}"),
        Err(_) => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_framing_reassembles_across_chunk_boundaries() {
        let mut parser = SseFraming::new(1024);
        let wire = "event: response.created\ndata: {\"type\":\"response.created\"}\n\ndata: {\"a\":1}\n\n";
        let mut collected = Vec::new();
        // Feed one byte at a time: chunk boundaries must not matter.
        for byte in wire.as_bytes() {
            collected.extend(parser.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(collected.len(), 2);
        assert!(collected[0].starts_with("event: response.created"));
        assert_eq!(collected[1], "data: {\"a\":1}\n\n");
        assert!(parser.finish().unwrap().is_none());
    }

    #[test]
    fn test_framing_handles_crlf_terminators() {
        let mut parser = SseFraming::new(1024);
        let events = parser
            .push(b"data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\n\n")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "data: {\"a\":1}\r\n\r\n");
        assert_eq!(events[1], "data: {\"b\":2}\n\n");
    }

    #[test]
    fn test_framing_event_size_limit() {
        let mut parser = SseFraming::new(16);
        let error = parser.push(b"data: 0123456789012345678901234567").unwrap_err();
        assert!(error.size_bytes > error.limit_bytes);
    }

    #[test]
    fn test_finish_returns_unterminated_tail() {
        let mut parser = SseFraming::new(1024);
        assert!(parser.push(b"data: {\"a\":1}").unwrap().is_empty());
        assert_eq!(parser.finish().unwrap().as_deref(), Some("data: {\"a\":1}"));
    }

    #[test]
    fn test_extract_data_joins_lines_and_skips_comments() {
        let block = ": comment\ndata: {\"a\":\ndata: 1}\n\n";
        assert_eq!(extract_data(block).as_deref(), Some("{\"a\":\n1}"));
        assert!(extract_data("data: [DONE]\n\n").is_none());
        assert!(extract_data(": only a comment\n\n").is_none());
    }

    #[test]
    fn test_alias_rewrite_preserves_separators() {
        let block = "event: response.text.delta\r\ndata: {\"type\":\"response.text.delta\",\"delta\":\"x\"}\r\n\r\n";
        let normalized = normalize_event_block(block);
        assert!(normalized.ends_with("\r\n\r\n"));
        assert!(normalized.contains("response.output_text.delta"));
        // The event: line is left alone; clients key on the data payload.
        assert!(normalized.starts_with("event: response.text.delta\r\n"));

        let untouched = "data: {\"type\":\"response.completed\"}\n\n";
        assert_eq!(normalize_event_block(untouched), untouched);
    }

    #[test]
    fn test_format_event_carries_type() {
        let formatted = format_event(&json!({"type": "response.failed", "response": {}}));
        assert!(formatted.starts_with("event: response.failed\ndata: "));
        assert!(formatted.ends_with("\n\n"));
        let bare = format_event(&json!({"a": 1}));
        assert!(bare.starts_with("data: "));
    }
}
