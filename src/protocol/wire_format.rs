//! Wire format encoding and decoding.
//!
//! Implements the 5-byte header format:
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ JSON flag│ Length   │ Body            │
//! │ 1 byte   │ 4 bytes  │ Length bytes    │
//! │ 0 or 1   │ uint32 BE│ UTF-8           │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! Flag `1` means the body is JSON text, `0` means the body is a plain
//! UTF-8 string. There is no checksum, version byte or compression.

use crate::error::{IpcError, Result};

/// Header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Default maximum body size (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Flag byte for a plain UTF-8 string body.
pub const FLAG_TEXT: u8 = 0;

/// Flag byte for a JSON body.
pub const FLAG_JSON: u8 = 1;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Whether the body is JSON text (`true`) or a raw string (`false`).
    pub body_is_json: bool,
    /// Body length in bytes.
    pub body_len: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(body_is_json: bool, body_len: u32) -> Self {
        Self {
            body_is_json,
            body_len,
        }
    }

    /// Header for an outgoing body of `body_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::ProtocolViolation`] if the length does not fit
    /// the 32-bit length field.
    pub fn for_body(body_is_json: bool, body_len: usize) -> Result<Self> {
        let body_len = u32::try_from(body_len).map_err(|_| {
            IpcError::ProtocolViolation(format!(
                "Body of {body_len} bytes does not fit a 32-bit length"
            ))
        })?;
        Ok(Self::new(body_is_json, body_len))
    }

    /// Encode header to bytes (Big Endian length).
    ///
    /// # Example
    ///
    /// ```
    /// use ipcwire::protocol::Header;
    ///
    /// let bytes = Header::new(true, 258).encode();
    /// assert_eq!(bytes, [1, 0, 0, 1, 2]);
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
    /// Panics if buffer is smaller than `HEADER_SIZE` (5 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = if self.body_is_json { FLAG_JSON } else { FLAG_TEXT };
        buf[1..5].copy_from_slice(&self.body_len.to_be_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `Ok(None)` if the buffer is too short and an error if the
    /// flag byte is neither `0` nor `1`.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let body_is_json = match buf[0] {
            FLAG_TEXT => false,
            FLAG_JSON => true,
            other => {
                return Err(IpcError::ProtocolViolation(format!(
                    "Invalid body flag {other:#04x}"
                )))
            }
        };
        Ok(Some(Self {
            body_is_json,
            body_len: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        }))
    }

    /// Reject bodies larger than `max_body_size`.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_len > max_body_size {
            return Err(IpcError::ProtocolViolation(format!(
                "Body size {} exceeds maximum {}",
                self.body_len, max_body_size
            )));
        }
        Ok(())
    }

    /// Total frame size (header + body).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(true, 100);
        let decoded = Header::decode(&original.encode()).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(false, 0x01020304).encode();

        assert_eq!(bytes[0], FLAG_TEXT);
        assert_eq!(&bytes[1..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_json_flag_byte() {
        assert_eq!(Header::new(true, 0).encode()[0], 1);
        assert_eq!(Header::new(false, 0).encode()[0], 0);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [1u8, 0, 0, 0];
        assert!(Header::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_flag() {
        let err = Header::decode(&[7, 0, 0, 0, 1]).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains("Invalid body flag"));
    }

    #[test]
    fn test_validate_body_too_large() {
        let header = Header::new(true, 1_000_000);
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert!(header.validate(1_000_000).is_ok());
    }

    #[test]
    fn test_for_body_checks_length_field() {
        assert_eq!(Header::for_body(true, 42).unwrap(), Header::new(true, 42));
        assert_eq!(
            Header::for_body(false, u32::MAX as usize).unwrap().body_len,
            u32::MAX
        );
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_for_body_rejects_length_past_u32() {
        let err = Header::for_body(false, u32::MAX as usize + 4).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(Header::new(false, 0).frame_len(), HEADER_SIZE);
        assert_eq!(Header::new(true, 10).frame_len(), HEADER_SIZE + 10);
    }
}
