//! Length-prefixed framing for the MeshCore companion TCP link.
//!
//! Every frame on the wire is:
//!
//!   `<marker u8><length u16 LE><payload>`
//!
//! where the marker is `<` (0x3C) for frames sent to the radio and `>` (0x3E)
//! for frames coming from it. The decoder is incremental: feed it arbitrary
//! chunks and pull whole payloads out. On garbage (unknown marker or oversize
//! length) it drops one leading byte and tries again.
use bytes::{Buf, BytesMut};

use crate::transport::TransportError;

/// Marker of frames written by the app.
pub const MARKER_TO_RADIO: u8 = 0x3C;
/// Marker of frames emitted by the radio.
pub const MARKER_FROM_RADIO: u8 = 0x3E;

const HEADER_LEN: usize = 3;

/// Upper bound on a single payload. Companion frames are far smaller.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Wrap an outbound payload in a `<` frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "payload of {} bytes exceeds frame limit of {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MARKER_TO_RADIO);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental decoder for `>` frames.
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if self.buf[0] != MARKER_FROM_RADIO {
                self.buf.advance(1);
                continue;
            }
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len > MAX_FRAME_SIZE {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(len).to_vec());
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
