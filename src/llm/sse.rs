//! Server-Sent-Events decoding for streamed chat completions.
//!
//! Bytes arrive in arbitrary chunks; a line (and a UTF-8 sequence) may be split
//! across two of them, so complete lines are cut from a byte buffer.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line.
    Data(String),
    /// The `data: [DONE]` line that closes an OpenAI stream.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);

    // Comments, blank separators and event/id/retry fields carry nothing we need
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}
