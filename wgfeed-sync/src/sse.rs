//! Server-sent-events wire handling.
//!
//! The realtime sync path receives `feed` events (data = one full success
//! envelope) and `ping` keepalives over a long-lived `text/event-stream`
//! response. [`SseParser`] is an incremental decoder fed raw body chunks;
//! event-name dispatch policy lives in the realtime client.

/// Connection state of one subscription's SSE stream.
///
/// `Error` is a side-channel signal; it always precedes a transition back
/// to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for SseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SseStatus::Disconnected => write!(f, "disconnected"),
            SseStatus::Connecting => write!(f, "connecting"),
            SseStatus::Connected => write!(f, "connected"),
            SseStatus::Error => write!(f, "error"),
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the stream did not name one.
    pub name: String,
    /// Data lines joined with `\n`.
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Feed it raw body chunks; completed events are appended to the caller's
/// buffer. Handles CRLF line endings, comment lines, multi-line data and
/// chunk boundaries that split lines. `id`/`retry` fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one body chunk, appending completed events to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<SseEvent>) {
        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line, out);
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // Blank line dispatches the pending event, if it has data.
            if !self.data_lines.is_empty() {
                let name = if self.event_name.is_empty() {
                    "message".to_string()
                } else {
                    std::mem::take(&mut self.event_name)
                };
                out.push(SseEvent {
                    name,
                    data: self.data_lines.join("\n"),
                });
            }
            self.event_name.clear();
            self.data_lines.clear();
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }
}
