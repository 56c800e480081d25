//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌──────────────┬────────────────┐
//! │ Frame length │ Correlation ID │
//! │ 4 bytes      │ 4 bytes        │
//! │ uint32 LE    │ uint32 LE      │
//! └──────────────┴────────────────┘
//! ```
//!
//! All fields are Little Endian. The length field counts the whole frame,
//! header included: `frame_length = 8 + payload_length`, so the smallest
//! legal value is 8 (a frame with an empty payload).

use crate::error::{Result, TransportError};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Largest frame the decoder will accept (1 GiB, header included).
///
/// A length beyond this means the stream is desynchronized, not that a
/// gigabyte message is in flight.
pub const MAX_FRAME_LENGTH: u32 = 1_073_741_824;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length in bytes, header included (`8 + payload`).
    pub frame_length: u32,
    /// Correlation identifier, echoed verbatim on the reply.
    pub correlation_id: u32,
}

impl FrameHeader {
    /// Create a header for a payload of `payload_length` bytes.
    pub fn for_payload(correlation_id: u32, payload_length: u32) -> Self {
        Self {
            frame_length: HEADER_SIZE as u32 + payload_length,
            correlation_id,
        }
    }

    /// Payload length implied by the length field.
    ///
    /// Callers must [`validate`](Self::validate) first; the subtraction
    /// saturates so a malformed header cannot wrap.
    #[inline]
    pub fn payload_length(&self) -> u32 {
        self.frame_length.saturating_sub(HEADER_SIZE as u32)
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use cachewire::protocol::FrameHeader;
    ///
    /// let header = FrameHeader::for_payload(42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 8);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.frame_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.correlation_id.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            frame_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            correlation_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Validate the length field.
    ///
    /// The length is header-inclusive, so anything below 8 cannot describe
    /// a frame; anything above [`MAX_FRAME_LENGTH`] is treated as stream
    /// desynchronization. Both are protocol errors and fatal to the
    /// connection that produced them.
    pub fn validate(&self) -> Result<()> {
        if self.frame_length < HEADER_SIZE as u32 {
            return Err(TransportError::Protocol(format!(
                "frame length {} is below the {}-byte header",
                self.frame_length, HEADER_SIZE
            )));
        }
        if self.frame_length > MAX_FRAME_LENGTH {
            return Err(TransportError::Protocol(format!(
                "frame length {} exceeds maximum {}",
                self.frame_length, MAX_FRAME_LENGTH
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = FrameHeader::for_payload(42, 100);
        let encoded = original.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = FrameHeader {
            frame_length: 0x0102_0304,
            correlation_id: 0x0506_0708,
        };
        let bytes = header.encode();

        // Frame length: 0x01020304 in LE
        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[1], 0x03);
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[3], 0x01);

        // Correlation ID: 0x05060708 in LE
        assert_eq!(bytes[4], 0x08);
        assert_eq!(bytes[5], 0x07);
        assert_eq!(bytes[6], 0x06);
        assert_eq!(bytes[7], 0x05);
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        let header = FrameHeader::for_payload(1, 0);
        assert_eq!(header.encode().len(), 8);
    }

    #[test]
    fn test_length_field_includes_header() {
        let header = FrameHeader::for_payload(7, 248);
        assert_eq!(header.frame_length, 256);
        assert_eq!(header.payload_length(), 248);
    }

    #[test]
    fn test_empty_payload_length_is_8() {
        let header = FrameHeader::for_payload(1, 0);
        assert_eq!(header.frame_length, 8);
        assert_eq!(header.payload_length(), 0);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7]; // One byte short
        assert!(FrameHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_length_below_header_rejected() {
        for bad in [0u32, 1, 7] {
            let header = FrameHeader {
                frame_length: bad,
                correlation_id: 1,
            };
            let result = header.validate();
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("header"));
        }
    }

    #[test]
    fn test_validate_length_above_max_rejected() {
        let header = FrameHeader {
            frame_length: MAX_FRAME_LENGTH + 1,
            correlation_id: 1,
        };
        let result = header.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_payload_length_saturates_on_malformed_header() {
        let header = FrameHeader {
            frame_length: 3,
            correlation_id: 1,
        };
        assert_eq!(header.payload_length(), 0);
    }

    #[test]
    fn test_encode_into() {
        let header = FrameHeader::for_payload(42, 100);
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_correlation_id_roundtrip_extremes() {
        for id in [0u32, 1, u32::MAX] {
            let header = FrameHeader::for_payload(id, 16);
            let decoded = FrameHeader::decode(&header.encode()).unwrap();
            assert_eq!(decoded.correlation_id, id);
        }
    }
}
