//! Server-sent events line decoder for streamed completions
//!
//! Network chunks can split a line (or a UTF-8 character) anywhere, so
//! bytes are buffered until a full line is available.

use futures_util::{Stream, StreamExt};

use super::ChatError;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// One decoded SSE line of interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line
    Data(String),
    /// `data: [DONE]`
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

    /// Feed a network chunk and return the events of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that had no newline
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return None;
    }

    // event:, id:, retry: and comments carry nothing we use
    let payload = line.strip_prefix(DATA_PREFIX)?.trim_start();
    if payload == DONE_MARKER {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

/// Drive a response body through the decoder, calling `on_data` for each
/// `data:` payload until `[DONE]` or end of body.
pub async fn drain_sse<S, B, F>(mut body: S, mut on_data: F) -> Result<(), ChatError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
    F: FnMut(&str),
{
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ChatError::Stream(e.to_string()))?;
        for event in decoder.push(chunk.as_ref()) {
            match event {
                SseEvent::Data(payload) => on_data(&payload),
                SseEvent::Done => return Ok(()),
            }
        }
    }

    if let Some(SseEvent::Data(payload)) = decoder.finish() {
        on_data(&payload);
    }
    Ok(())
}
