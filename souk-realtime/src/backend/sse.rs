//! Incremental server-sent-events decoder.
//!
//! Chunks from the HTTP body may split lines (and UTF-8 sequences) anywhere,
//! so complete lines are only decoded once their terminator arrives.

/// One dispatched event block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Value of the last `event:` field
    pub event: Option<String>,
    /// `data:` lines joined with newlines
    pub data: String,
    /// Value of the last `id:` field
    pub id: Option<String>,
}

/// Line-buffering decoder for a `text/event-stream` body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
    event_id: Option<String>,
}

impl SseDecoder {
    /// Empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one body chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.handle_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.event_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event_name.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
            id: self.event_id.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: ack\ndata: {}\n\nevent: heartbeat\ndata: {}\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ack"));
        assert_eq!(events[1].event.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn buffers_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"event: ins").is_empty());
        assert!(decoder.push(b"ert\r\ndata: {\"a\":").is_empty());
        let events = decoder.push(b"1}\r\nid: 7\r\n\r\n");

        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("insert".into()),
                data: "{\"a\":1}".into(),
                id: Some("7".into()),
            }]
        );
    }

    #[test]
    fn buffers_split_utf8_sequences() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: café\n\n".as_bytes();
        let split = bytes.len() - 3;

        assert!(decoder.push(&bytes[..split]).is_empty());
        let events = decoder.push(&bytes[split..]);
        assert_eq!(events[0].data, "café");
    }

    #[test]
    fn joins_multi_line_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\n\ndata: one\ndata: two\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "one\ntwo");
    }
}
