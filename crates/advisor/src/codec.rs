//! SSE framing for advisor stream events
//!
//! Every event travels as a single `data: <json>\n\n` frame and the logical
//! stream ends with the `data: [DONE]\n\n` sentinel. Decoding is best effort:
//! a malformed frame is logged and skipped, it never aborts the stream.

use bytes::BytesMut;
use serde_json::json;

use crate::models::event::{StreamEvent, StreamFrame};

/// Payload of the frame that terminates a logical stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A decoded SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamFrame),
    Done,
}

/// Encode a frame as `data: <json>\n\n`.
pub fn encode(frame: &StreamFrame) -> String {
    let json = serde_json::to_string(frame).unwrap_or_else(|e| {
        tracing::error!("Failed to encode {} event: {}", frame.event.kind(), e);
        json!({"type": "error", "error": "Failed to encode event"}).to_string()
    });
    format!("data: {}\n\n", json)
}

/// Encode an event stamped with the current time.
pub fn encode_event(event: StreamEvent) -> String {
    encode(&StreamFrame::new(event))
}

pub fn encode_done() -> String {
    format!("data: {}\n\n", DONE_SENTINEL)
}

/// Extract the `data` field of one raw SSE frame.
///
/// Multiple `data:` lines are joined with a newline, comment lines and other
/// fields are ignored. Returns `None` when the frame has no data at all
/// (for example a keep-alive comment).
pub fn data_payload(raw: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_payload(payload: &str) -> Result<Frame, serde_json::Error> {
    if payload.trim() == DONE_SENTINEL {
        return Ok(Frame::Done);
    }
    serde_json::from_str::<StreamFrame>(payload).map(Frame::Event)
}

/// Decode one raw frame. Returns `None` for frames without data and for
/// malformed payloads, which are logged.
pub fn decode(raw: &str) -> Option<Frame> {
    let payload = data_payload(raw)?;
    match parse_payload(&payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("Skipping malformed stream frame: {} ({})", payload, e);
            None
        }
    }
}

/// Accumulates bytes until complete SSE frames (terminated by a blank line)
/// are available and yields their data payloads.
///
/// Carriage returns are dropped so `\r\n` delimited streams split the same
/// way as `\n` delimited ones.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: BytesMut,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the payloads of every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = find_frame_boundary(&self.buffer) {
            let raw = self.buffer.split_to(pos + 2);
            let text = String::from_utf8_lossy(&raw);
            if let Some(payload) = data_payload(&text) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush whatever is left once the underlying stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = self.buffer.split();
        data_payload(&String::from_utf8_lossy(&raw))
    }
}

fn find_frame_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\n\n")
}

/// Incremental decoder for advisor event streams.
///
/// Malformed frames are counted and skipped. Once the `[DONE]` sentinel has
/// been seen nothing further is yielded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    sse: SseBuffer,
    skipped: usize,
    done: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let payloads = self.sse.push(chunk);
        self.decode_payloads(payloads)
    }

    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let payloads: Vec<String> = self.sse.finish().into_iter().collect();
        self.decode_payloads(payloads)
    }

    /// Number of frames dropped because they did not decode.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_payloads(&mut self, payloads: Vec<String>) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        for payload in payloads {
            if self.done {
                break;
            }
            match parse_payload(&payload) {
                Ok(Frame::Event(frame)) => frames.push(frame),
                Ok(Frame::Done) => self.done = true,
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!("Skipping malformed stream frame: {} ({})", payload, e);
                }
            }
        }
        frames
    }
}
