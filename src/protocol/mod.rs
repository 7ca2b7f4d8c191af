//! Protocol module - wire format, framing, and message types.
//!
//! This module implements the framing used on every connection:
//! - 5-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame and message types

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, Frame, Message};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{Header, DEFAULT_MAX_BODY_SIZE, FLAG_JSON, FLAG_TEXT, HEADER_SIZE};
