//! Wire codec for the Unix socket.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: JSON message (UTF-8 `serde_json::Value`). Peers send
//!   `{"action": name, "payload": {...}}`; the Hub sends event envelopes.
//! - `0x02`: Raw keystrokes (peer→hub), routed like terminal input.
//!
//! A well-framed JSON frame whose payload does not parse is skipped and
//! reported through [`FrameDecoder::take_rejected`]; the stream stays
//! usable. Bad lengths and unknown frame types are stream errors.

use anyhow::{anyhow, bail, Result};

/// Maximum frame payload size (16 MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// JSON message.
    pub const JSON: u8 = 0x01;
    /// Raw keystrokes (peer → hub).
    pub const INPUT: u8 = 0x02;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON message.
    Json(serde_json::Value),
    /// Raw keystrokes for the focused session.
    Input(Vec<u8>),
}

impl Frame {
    /// Encodes this frame as `[u32 LE length][u8 type][payload]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is larger than the frame limit.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Frame::Json(value) => {
                let payload = serde_json::to_vec(value)?;
                encode_raw(frame_type::JSON, &payload)
            }
            Frame::Input(data) => encode_raw(frame_type::INPUT, data),
        }
    }
}

fn encode_raw(frame_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len() + 1)
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| anyhow!("Frame too large: {} bytes", payload.len()))?;
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// `Ok(Err(reason))` is a frame to skip; `Err` ends the stream.
fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<std::result::Result<Frame, String>> {
    match frame_type {
        frame_type::JSON => Ok(serde_json::from_slice(payload)
            .map(Frame::Json)
            .map_err(|e| format!("Invalid JSON frame: {e}"))),
        frame_type::INPUT => Ok(Ok(Frame::Input(payload.to_vec()))),
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    rejected: Vec<String>,
}

impl FrameDecoder {
    /// Decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every complete frame. Incomplete data is
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame header is malformed or exceeds the size
    /// limit. JSON that does not parse only skips its frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while self.buf.len() >= 4 {
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }
            match decode_frame(self.buf[4], &self.buf[5..total])? {
                Ok(frame) => frames.push(frame),
                Err(reason) => self.rejected.push(reason),
            }
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Reasons for frames skipped since the last call.
    pub fn take_rejected(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rejected)
    }

    /// Whether partial data is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
