//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 5 bytes
//! - `WaitingForBody`: Header parsed, need `body_len` more bytes
//!
//! Chunk boundaries carry no meaning. A frame may span many chunks and a
//! chunk may hold many frames; only the length in the header delimits them.
//!
//! # Example
//!
//! ```
//! use ipcwire::protocol::{build_frame, FrameBuffer, Message};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(&Message::from("hello")).unwrap();
//!
//! // Header split across two chunks
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].body(), b"hello");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 5 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 64MB.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the frames in arrival order (may be empty if still waiting
    /// for data). Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header is malformed or announces a body larger
    /// than the configured maximum.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer)? {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_body_size)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForBody { header };
                }

                State::WaitingForBody { header } => {
                    let header = *header;
                    let body_len = header.body_len as usize;

                    if self.buffer.len() < body_len {
                        return Ok(None);
                    }

                    let body = if body_len == 0 {
                        Bytes::new()
                    } else {
                        self.buffer.split_to(body_len).freeze()
                    };
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Frame::new(header, body)));
                }
            }
        }
    }

    /// Snapshot of the bytes received but not yet consumed as a frame.
    ///
    /// A parsed header whose body is still incomplete is already consumed
    /// and not part of the snapshot.
    pub fn buffered(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a header has been parsed and its body is still incomplete.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, State::WaitingForBody { .. })
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
