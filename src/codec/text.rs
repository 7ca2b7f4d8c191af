//! Text codec - plain UTF-8 string bodies.
//!
//! Used when the caller hands the protocol a string: the body is the
//! string's UTF-8 bytes, sent without any further serialization.
//!
//! # Example
//!
//! ```
//! use ipcwire::codec::TextCodec;
//!
//! let encoded = TextCodec::encode("pong");
//! assert_eq!(&encoded[..], b"pong");
//! assert_eq!(TextCodec::decode(&encoded), "pong");
//! ```

use bytes::Bytes;

/// Codec for plain string bodies.
pub struct TextCodec;

impl TextCodec {
    /// Encode a string to its UTF-8 bytes.
    #[inline]
    pub fn encode(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    /// Decode UTF-8 bytes, replacing invalid sequences with U+FFFD.
    #[inline]
    pub fn decode(data: &[u8]) -> String {
        String::from_utf8_lossy(data).into_owned()
    }
}
