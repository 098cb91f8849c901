use crate::protocol::{FinalResponse, StreamEvent};

/// Result of decoding one complete NDJSON line.
#[derive(Debug)]
pub enum DecodedLine {
    /// A tagged stream event.
    Event(StreamEvent),
    /// A bare final envelope without a `type` tag, emitted by older backends.
    LegacyFinal(FinalResponse),
    /// A line that is not valid JSON or not a known event shape.
    /// Reported and skipped; it never aborts the stream.
    Malformed { line: String, reason: String },
}

/// Incremental NDJSON decoder.
///
/// Bytes are buffered until a newline completes a record, so chunk boundaries
/// (including splits in the middle of a line or a multi-byte character) never
/// change the decoded event sequence.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk of raw bytes, returning every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..newline]);
            if let Some(record) = decode_line(&text) {
                decoded.push(record);
            }
        }
        decoded
    }

    /// Flush the trailing partial line after the stream ends.
    ///
    /// Servers are expected to newline-terminate every record, but a final
    /// record without a trailing newline is still honored.
    pub fn finish(&mut self) -> Vec<DecodedLine> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        decode_line(&text).into_iter().collect()
    }
}

/// Decode one line. Blank lines yield `None`.
fn decode_line(line: &str) -> Option<DecodedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            return Some(DecodedLine::Malformed {
                line: trimmed.to_string(),
                reason: err.to_string(),
            });
        }
    };

    if value.get("type").is_some() {
        return Some(match serde_json::from_value::<StreamEvent>(value) {
            Ok(event) => DecodedLine::Event(event),
            Err(err) => DecodedLine::Malformed {
                line: trimmed.to_string(),
                reason: err.to_string(),
            },
        });
    }

    // Legacy shape: a raw final envelope, detectable by `success` plus a
    // string `response`.
    if value.get("success").is_some() && value.get("response").is_some_and(|r| r.is_string()) {
        return Some(match serde_json::from_value::<FinalResponse>(value) {
            Ok(response) => DecodedLine::LegacyFinal(response),
            Err(err) => DecodedLine::Malformed {
                line: trimmed.to_string(),
                reason: err.to_string(),
            },
        });
    }

    Some(DecodedLine::Malformed {
        line: trimmed.to_string(),
        reason: "unknown NDJSON event shape".to_string(),
    })
}
