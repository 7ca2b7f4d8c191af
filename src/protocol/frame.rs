//! Frame and message types.
//!
//! A [`Frame`] is one header plus its body as it came off the wire.
//! A [`Message`] is what the application sends and receives: either a
//! plain string (flag `0`) or a JSON value (flag `1`).
//!
//! # Example
//!
//! ```
//! use ipcwire::protocol::{build_frame, FrameBuffer, Message};
//! use serde_json::json;
//!
//! let bytes = build_frame(&Message::Json(json!({"cmd": "ping"}))).unwrap();
//! let frames = FrameBuffer::new().push(&bytes).unwrap();
//!
//! assert_eq!(frames[0].clone().into_message().unwrap(), Message::Json(json!({"cmd": "ping"})));
//! ```

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use super::wire_format::{Header, HEADER_SIZE};
use crate::codec::{JsonCodec, TextCodec};
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the body is JSON text.
    #[inline]
    pub fn is_json(&self) -> bool {
        self.header.body_is_json
    }

    /// Decode the body into a [`Message`].
    ///
    /// JSON bodies are parsed; text bodies are decoded as UTF-8, replacing
    /// invalid sequences.
    pub fn into_message(self) -> Result<Message> {
        if self.header.body_is_json {
            Ok(Message::Json(JsonCodec::decode(&self.body)?))
        } else {
            Ok(Message::Text(TextCodec::decode(&self.body)))
        }
    }
}

/// An application-level message carried by one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A plain string, sent with flag `0`.
    Text(String),
    /// A JSON value, sent with flag `1`.
    Json(Value),
}

impl Message {
    /// Serialize the message body and build its header.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the body is too long for the
    /// length field.
    pub fn encode(&self) -> Result<(Header, Bytes)> {
        let (is_json, body) = match self {
            Message::Text(text) => (false, TextCodec::encode(text)),
            Message::Json(value) => (true, JsonCodec::encode_value(value)),
        };
        Ok((Header::for_body(is_json, body.len())?, body))
    }

    /// Borrow the text, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Json(_) => None,
        }
    }

    /// Borrow the JSON value, if this is a JSON message.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Message::Json(value) => Some(value),
            Message::Text(_) => None,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Json(value)
    }
}

/// Build the wire bytes for one message as a single contiguous buffer.
///
/// # Errors
///
/// Fails like [`Message::encode`].
pub fn build_frame(message: &Message) -> Result<Bytes> {
    let (header, body) = message.encode()?;
    Ok(build_frame_parts(&header, &body))
}

/// Build the wire bytes from a header and an already-serialized body.
pub fn build_frame_parts(header: &Header, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_message_encoding() {
        let bytes = build_frame(&Message::from("pong")).unwrap();

        assert_eq!(&bytes[..], &[0, 0, 0, 0, 4, b'p', b'o', b'n', b'g']);
    }

    #[test]
    fn test_json_message_encoding() {
        let bytes = build_frame(&Message::Json(json!({"cmd": "ping"}))).unwrap();
        let body = br#"{"cmd":"ping"}"#;

        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[5..], body);
    }

    #[test]
    fn test_length_counts_utf8_bytes() {
        let (header, body) = Message::from("héllo ✓").encode().unwrap();

        assert_eq!(header.body_len as usize, "héllo ✓".len());
        assert_eq!(body.len(), "héllo ✓".len());
        assert!("héllo ✓".chars().count() < body.len());
    }

    #[test]
    fn test_into_message_json() {
        let frame = Frame::new(Header::new(true, 7), Bytes::from_static(b"[1,2,3]"));
        assert_eq!(frame.into_message().unwrap(), Message::Json(json!([1, 2, 3])));
    }

    #[test]
    fn test_into_message_text_is_not_parsed() {
        let frame = Frame::new(Header::new(false, 7), Bytes::from_static(b"[1,2,3]"));
        assert_eq!(
            frame.into_message().unwrap(),
            Message::Text("[1,2,3]".to_string())
        );
    }

    #[test]
    fn test_into_message_invalid_json() {
        let frame = Frame::new(Header::new(true, 3), Bytes::from_static(b"{{{"));
        assert!(frame.into_message().is_err());
    }

    #[test]
    fn test_json_string_stays_json() {
        let message = Message::Json(json!("pong"));
        let (header, _) = message.encode().unwrap();
        assert!(header.body_is_json);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Message::from("x").as_text(), Some("x"));
        assert!(Message::from("x").as_json().is_none());
        assert_eq!(Message::from(json!(1)).as_json(), Some(&json!(1)));
    }
}
