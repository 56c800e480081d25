//! Frame decoder for accumulating partial reads.
//!
//! Reassembles discrete frames from a stream of arbitrarily-sized byte
//! chunks. Implements a two-state machine:
//! - `AwaitingHeader`: need 8 header bytes; they may arrive spread over
//!   any number of chunks (even one byte at a time)
//! - `AwaitingPayload`: header parsed, need `frame_length - 8` more bytes
//!
//! One decoder instance exists per connection; instances are pooled and
//! reset between connections. Accumulation uses `bytes::BytesMut`, and
//! completed payloads are split off zero-copy.
//!
//! # Example
//!
//! ```
//! use cachewire::protocol::{build_frame, FrameDecoder};
//!
//! let mut decoder = FrameDecoder::new();
//! let wire = build_frame(42, b"hello");
//!
//! // Data arrives in chunks from the socket
//! let frames = decoder.push(&wire).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].correlation_id, 42);
//! ```

use bytes::{Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{FrameHeader, HEADER_SIZE};
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete 8-byte header.
    AwaitingHeader,
    /// Header parsed, waiting for the rest of the frame.
    AwaitingPayload { header: FrameHeader, remaining: u32 },
}

/// Accumulates incoming chunks and extracts complete frames.
///
/// The accumulator grows only as far as the largest in-flight frame; the
/// chunk buffers themselves are returned to their pool by the caller as
/// soon as `push` returns, having been copied in here.
pub struct FrameDecoder {
    /// Accumulated bytes not yet consumed by a complete frame.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl FrameDecoder {
    /// Create a new decoder in the awaiting-header state.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * HEADER_SIZE),
            state: State::AwaitingHeader,
        }
    }

    /// Push one chunk's bytes and extract every frame they complete.
    ///
    /// Returns all frames that became complete, in wire order; an empty
    /// vector means more data is needed. Partial data stays buffered for
    /// the next push, so a header split across three one-byte chunks
    /// assembles correctly.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a header's length field is invalid
    /// (below 8 or past the sanity cap). The stream is desynchronized at
    /// that point; the connection must be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::AwaitingHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = FrameHeader::decode(&self.buffer[..HEADER_SIZE])
                    .expect("buffer holds at least HEADER_SIZE bytes");
                header.validate()?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                // Length field counts the header itself.
                let remaining = header.payload_length();
                if remaining == 0 {
                    return Ok(Some(Frame::new(header.correlation_id, Bytes::new())));
                }

                self.state = State::AwaitingPayload { header, remaining };
                self.try_extract_one()
            }

            State::AwaitingPayload { header, remaining } => {
                let remaining = *remaining as usize;

                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let correlation_id = header.correlation_id;

                self.state = State::AwaitingHeader;

                Ok(Some(Frame::new(correlation_id, payload)))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::AwaitingHeader)
    }

    /// Clear the buffer and return to the awaiting-header state.
    ///
    /// The pool runs this on release so a recycled decoder never carries
    /// one connection's partial frame into another connection's stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitingHeader => "AwaitingHeader",
            State::AwaitingPayload { .. } => "AwaitingPayload",
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
