//! Length-delimited framing.
//!
//! ```text
//! +---------------------------+----------------------+
//! | total length (u32, BE)    | payload              |
//! | = 4 + payload.len()       | payload.len() bytes  |
//! +---------------------------+----------------------+
//! ```
//!
//! The prefix counts itself, so a well-formed frame always declares more than
//! [`HEADER_LEN`] bytes. Payloads are opaque to this layer.

use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single payload (10 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The prefix declares no payload at all.
    #[error("frame length {declared} is not larger than the {HEADER_LEN}-byte header")]
    Undersized { declared: usize },

    /// The prefix declares a payload above the configured maximum.
    #[error("frame payload of {payload} bytes exceeds maximum of {max} bytes")]
    Oversized { payload: usize, max: usize },
}

/// Frames `payload` into a single contiguous buffer ready for the socket.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let total = (HEADER_LEN + payload.len()) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Checks that `payload` can be framed under `max_frame_len`.
pub fn validate_payload(payload: &[u8], max_frame_len: usize) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Undersized {
            declared: HEADER_LEN,
        });
    }
    if payload.len() > max_frame_len {
        return Err(FrameError::Oversized {
            payload: payload.len(),
            max: max_frame_len,
        });
    }
    Ok(())
}

/// Incremental decoder that accumulates socket reads until whole frames are
/// available.
///
/// Consumed bytes are tracked with a cursor and compacted away lazily, so a
/// burst of small frames in one read costs a single `drain`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    cursor: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            max_frame_len,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Returns the next complete payload, `Ok(None)` if more bytes are needed.
    ///
    /// A bad prefix is reported as soon as the header is readable, without
    /// waiting for the (possibly huge) declared body.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let pending = &self.buf[self.cursor..];
        if pending.len() < HEADER_LEN {
            self.compact();
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&pending[..HEADER_LEN]);
        let declared = u32::from_be_bytes(header) as usize;

        if declared <= HEADER_LEN {
            return Err(FrameError::Undersized { declared });
        }
        let payload_len = declared - HEADER_LEN;
        if payload_len > self.max_frame_len {
            return Err(FrameError::Oversized {
                payload: payload_len,
                max: self.max_frame_len,
            });
        }

        if pending.len() < declared {
            self.compact();
            return Ok(None);
        }

        let start = self.cursor + HEADER_LEN;
        let payload = self.buf[start..start + payload_len].to_vec();
        self.cursor += declared;
        Ok(Some(payload))
    }

    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        if self.cursor == self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..self.cursor);
        }
        self.cursor = 0;
    }
}
