//! Server-Sent-Events parsing.
//!
//! A line-oriented state machine: `event:`, `data:` and `id:` fields
//! accumulate until a blank line dispatches the event. Multi-line `data:`
//! values are joined with `\n`, `retry:` overrides the reconnect delay and
//! lines starting with `:` are comments. All buffers live on the parser, so
//! every stream gets its own accumulator.

use std::time::Duration;

/// Event type used when a block carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    event_type: Option<String>,
    data: Option<String>,
    id: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the stream, returning every event they complete.
    /// Partial lines are kept until the rest arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Process one complete line (without its terminator).
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.retry = Some(Duration::from_millis(ms));
                    }
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        let data = self.data.take();
        let id = self.id.take();

        let data = data.filter(|d| !d.trim().is_empty())?;
        Some(SseEvent {
            event: event_type
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id,
        })
    }

    /// Take the most recent `retry:` override, if one arrived since the last call.
    pub fn take_retry(&mut self) -> Option<Duration> {
        self.retry.take()
    }

    /// The last `id:` seen on this stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// End of stream: flush an unterminated last line and dispatch whatever
    /// has accumulated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            let line = String::from_utf8_lossy(&line).into_owned();
            self.feed_line(&line);
        }
        self.dispatch()
    }

    /// Discard any half-accumulated event and buffered bytes.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.event_type = None;
        self.data = None;
        self.id = None;
    }
}

/// Decode a complete SSE body into its events.
pub fn decode_events(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.feed(body.as_bytes());
    // A body that ends without the closing blank line still holds one event.
    events.extend(parser.finish());
    events
}
