// SPDX-License-Identifier: MIT

//! Multiplexed log frame codec.
//!
//! The runtime interleaves stdout and stderr on one byte stream using an
//! 8-byte header per frame:
//!
//! ```text
//! byte 0   : stream type (0 = stdin, 1 = stdout, 2 = stderr)
//! bytes 1-3: reserved (zero)
//! bytes 4-7: payload length, big-endian u32
//! bytes 8-N: payload (UTF-8 bytes of possibly-partial lines)
//! ```
//!
//! The decoder accumulates bytes across arbitrary chunk boundaries; a
//! frame is only surfaced once its full payload has arrived.

use dh_core::LogStream;

const HEADER_LEN: usize = 8;

/// Stream tag of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStream {
    /// Ignored by the collector, but still framed by the runtime.
    Stdin,
    Stdout,
    Stderr,
}

impl FrameStream {
    /// Collector-facing mapping; stdin frames carry no log entries.
    pub fn as_log_stream(self) -> Option<LogStream> {
        match self {
            FrameStream::Stdin => None,
            FrameStream::Stdout => Some(LogStream::Stdout),
            FrameStream::Stderr => Some(LogStream::Stderr),
        }
    }
}

/// Encode one frame (used by tests and fakes).
pub fn encode_frame(stream: FrameStream, payload: &[u8]) -> Vec<u8> {
    let tag: u8 = match stream {
        FrameStream::Stdin => 0,
        FrameStream::Stdout => 1,
        FrameStream::Stderr => 2,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if one has fully arrived.
    ///
    /// A frame with an unknown stream tag is skipped (its payload is
    /// consumed) so one bad frame cannot wedge the stream.
    pub fn next_frame(&mut self) -> Option<(FrameStream, Vec<u8>)> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }

            let tag = self.buf[0];
            let payload: Vec<u8> =
                self.buf.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();

            let stream = match tag {
                0 => FrameStream::Stdin,
                1 => FrameStream::Stdout,
                2 => FrameStream::Stderr,
                other => {
                    tracing::debug!(tag = other, len, "skipping frame with unknown stream tag");
                    continue;
                }
            };
            return Some((stream, payload));
        }
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
