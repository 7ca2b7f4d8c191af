//! Codec module - serialization/deserialization for frame bodies.
//!
//! - [`TextCodec`] - Plain UTF-8 strings (flag `0`)
//! - [`JsonCodec`] - JSON text using `serde_json` (flag `1`)
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! The flag byte in the header selects the codec on the receiving side.

mod json;
mod text;

pub use json::JsonCodec;
pub use text::TextCodec;
