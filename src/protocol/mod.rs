//! Wire protocol: framing, header layout, decoding.
//!
//! A frame on the wire is an 8-byte header followed by the payload. The
//! header carries the total frame length (header-inclusive) and the
//! correlation id used to match replies to requests. Encoding is
//! [`build_frame`]; decoding is the chunk-fed [`FrameDecoder`].

mod decoder;
mod frame;
mod wire_format;

pub use decoder::FrameDecoder;
pub use frame::{build_frame, Frame};
pub use wire_format::{FrameHeader, HEADER_SIZE, MAX_FRAME_LENGTH};
