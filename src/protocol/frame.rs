//! Frame type and frame building.
//!
//! A [`Frame`] is one decoded message: the correlation id from the header
//! plus the payload. Uses `bytes::Bytes` for zero-copy payload sharing
//! between the decoder, the multiplexer, and handler code.

use bytes::Bytes;

use super::wire_format::{FrameHeader, HEADER_SIZE};

/// A complete decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id carried in the header.
    pub correlation_id: u32,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(correlation_id: u32, payload: Bytes) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Build a complete frame as a single contiguous byte vector.
///
/// The header's length field is set to `8 + payload.len()` (the total
/// frame length on the wire). The resulting buffer is submitted to the
/// socket as one write, which is what keeps frames from concurrent
/// senders whole on the wire.
///
/// # Example
///
/// ```
/// use cachewire::protocol::{build_frame, FrameHeader, HEADER_SIZE};
///
/// let bytes = build_frame(42, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// let header = FrameHeader::decode(&bytes).unwrap();
/// assert_eq!(header.frame_length, 13);
/// assert_eq!(header.correlation_id, 42);
/// ```
pub fn build_frame(correlation_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::for_payload(correlation_id, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::super::decoder::FrameDecoder;
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(42, Bytes::from_static(b"hello"));
        assert_eq!(frame.correlation_id, 42);
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_frame_empty_payload() {
        let frame = Frame::new(1, Bytes::new());
        assert_eq!(frame.payload_len(), 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_build_frame_layout() {
        let bytes = build_frame(7, b"hello");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let header = FrameHeader::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.frame_length, 13);
        assert_eq!(header.correlation_id, 7);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_empty_payload() {
        let bytes = build_frame(9, b"");

        assert_eq!(bytes.len(), HEADER_SIZE);
        let header = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(header.frame_length, 8);
    }

    #[test]
    fn test_build_frame_roundtrip() {
        let payload = b"0123456789";
        let bytes = build_frame(456, payload);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].correlation_id, 456);
        assert_eq!(frames[0].payload(), payload);
    }
}
