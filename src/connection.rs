//! Framed duplex message channel over one byte stream.
//!
//! A [`Protocol`] owns one connected stream (Unix socket, named pipe, TCP
//! socket, or an in-memory duplex in tests) and runs two tasks on it:
//!
//! ```text
//!            ┌──────────── Protocol ────────────┐
//! socket ──► │ read loop ─► FrameBuffer ─► on_message
//!            │                                   │
//! socket ◄── │ writer task ◄── send / send_json  │
//!            └───────────────────────────────────┘
//! ```
//!
//! The read loop extracts one frame at a time and fires it before looking
//! at the next, re-checking the disposed flag in between so a subscriber
//! may dispose the connection from inside its own callback.
//!
//! # Example
//!
//! ```
//! use ipcwire::{Message, Protocol};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (a, b) = tokio::io::duplex(1024);
//! let left = Protocol::new(a);
//! let right = Protocol::new(b);
//! let mut inbox = right.on_message().listen();
//!
//! left.send_json(&json!({"cmd": "ping"})).unwrap();
//! assert_eq!(inbox.recv().await, Some(Message::Json(json!({"cmd": "ping"}))));
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::codec::JsonCodec;
use crate::error::{IpcError, Result};
use crate::event::{Emitter, Event};
use crate::protocol::{FrameBuffer, Header, Message, DEFAULT_MAX_BODY_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Default size of the socket read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Largest body a peer may announce before the connection is closed.
    pub max_body_size: u32,
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Write coalescing settings.
    pub writer: WriterConfig,
}

impl ProtocolConfig {
    /// Set the maximum accepted body size.
    pub fn max_body_size(mut self, limit: u32) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Set the socket read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the maximum number of frames merged into one write.
    pub fn max_batch_frames(mut self, limit: usize) -> Self {
        self.writer.max_batch_frames = limit;
        self
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Fired once when the underlying stream closes.
///
/// Consumers that only care that the peer is gone can ignore `error`;
/// it is `None` for an orderly end of stream.
#[derive(Debug, Clone, Default)]
pub struct CloseEvent {
    /// Why the stream closed, if it was not a clean end of stream.
    pub error: Option<Arc<IpcError>>,
}

impl CloseEvent {
    /// Whether the peer ended the stream without an error.
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

struct Shared {
    reader: Mutex<FrameBuffer>,
    disposed: AtomicBool,
    closed: AtomicBool,
    on_message: Emitter<Message>,
    on_close: Emitter<CloseEvent>,
    closed_tx: watch::Sender<bool>,
    max_body_size: u32,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    reader: Option<AbortHandle>,
    writer: Option<AbortHandle>,
}

impl Shared {
    fn reader(&self) -> MutexGuard<'_, FrameBuffer> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark the stream closed and fire `on_close` at most once.
    fn close(&self, error: Option<IpcError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &error {
            Some(e) if e.is_protocol_violation() => tracing::warn!("Closing connection: {}", e),
            Some(e) => tracing::debug!("Connection closed with error: {}", e),
            None => tracing::trace!("Connection closed by peer"),
        }
        if !self.is_disposed() {
            self.on_close.fire(CloseEvent {
                error: error.map(Arc::new),
            });
        }
        self.on_message.dispose();
        self.on_close.dispose();
        self.closed_tx.send_replace(true);
    }
}

/// A framed, bidirectional message channel over one byte stream.
///
/// Cloning is cheap and every clone refers to the same connection.
/// Construction spawns tasks and must happen inside a tokio runtime.
#[derive(Clone)]
pub struct Protocol {
    shared: Arc<Shared>,
    writer: WriterHandle,
}

impl Protocol {
    /// Wrap a connected stream with default settings.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, ProtocolConfig::default())
    }

    /// Wrap a connected stream.
    pub fn with_config<S>(stream: S, config: ProtocolConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_first_chunk(stream, Bytes::new(), config)
    }

    /// Wrap a connected stream whose first bytes were already read by
    /// someone else (e.g. during a handshake).
    ///
    /// `first_chunk` is placed in front of everything read from `stream`
    /// and processed as soon as the read loop starts, even if the stream
    /// never delivers another byte.
    pub fn with_first_chunk<S>(stream: S, first_chunk: Bytes, config: ProtocolConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut frame_buffer = FrameBuffer::with_max_body(config.max_body_size);
        frame_buffer.extend(&first_chunk);

        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            reader: Mutex::new(frame_buffer),
            disposed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            on_message: Emitter::buffered(),
            on_close: Emitter::new(),
            closed_tx,
            max_body_size: config.max_body_size,
            tasks: Mutex::new(Tasks::default()),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer);

        let reader_task = tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            writer.clone(),
            config.read_buffer_size.max(1),
        ));

        if let Ok(mut tasks) = shared.tasks.lock() {
            tasks.writer = Some(writer_task.abort_handle());
            tasks.reader = Some(reader_task.abort_handle());
        }

        Self { shared, writer }
    }

    /// Send a message. Dropped silently if the connection is gone.
    ///
    /// A message whose body exceeds `max_body_size` is dropped with a
    /// warning; use [`send_json`](Self::send_json) to observe that error.
    pub fn send(&self, message: impl Into<Message>) {
        let frame = message
            .into()
            .encode()
            .and_then(|(header, body)| self.outbound(header, body));
        match frame {
            Ok(frame) => self.send_frame(frame),
            Err(e) => tracing::warn!("Dropping outgoing message: {}", e),
        }
    }

    /// Send a plain string (flag `0`).
    pub fn send_text(&self, text: &str) {
        self.send(text);
    }

    /// Serialize `value` to JSON and send it (flag `1`).
    ///
    /// # Errors
    ///
    /// Fails if `value` cannot be serialized, or with
    /// [`IpcError::ProtocolViolation`] if the body exceeds `max_body_size`.
    /// A closed connection drops the message without an error.
    pub fn send_json<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = JsonCodec::encode(value)?;
        let header = Header::for_body(true, body.len())?;
        self.send_frame(self.outbound(header, body)?);
        Ok(())
    }

    /// The peer would close on a body above the limit, so it never leaves.
    fn outbound(&self, header: Header, body: Bytes) -> Result<OutboundFrame> {
        header.validate(self.shared.max_body_size)?;
        Ok(OutboundFrame::new(&header, body))
    }

    fn send_frame(&self, frame: OutboundFrame) {
        if self.shared.is_disposed() {
            tracing::trace!("Dropping message sent on disposed connection");
            return;
        }
        self.writer.send(frame);
    }

    /// Fires once per received message, in arrival order.
    ///
    /// Messages that arrive before anyone subscribes are kept and handed
    /// to the first subscriber.
    pub fn on_message(&self) -> Event<Message> {
        self.shared.on_message.event()
    }

    /// Fires exactly once when the stream closes for any reason.
    pub fn on_close(&self) -> Event<CloseEvent> {
        self.shared.on_close.event()
    }

    /// Wait until the stream is closed or the protocol disposed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether the stream has closed or the protocol was disposed.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Snapshot of bytes received but not yet consumed as a frame.
    pub fn buffer(&self) -> Bytes {
        self.shared.reader().buffered()
    }

    /// Graceful half-close: queued messages are written, then the write
    /// side of the stream is shut down. Messages from the peer keep
    /// arriving until it closes its side.
    ///
    /// A later [`dispose`](Self::dispose) still discards whatever `end`
    /// has not written yet; use [`end_and_dispose`](Self::end_and_dispose)
    /// to stop using the connection without losing queued messages.
    pub fn end(&self) {
        self.writer.end();
    }

    /// Tear the connection down immediately.
    ///
    /// Detaches every subscriber, stops reading (also when called from an
    /// `on_message` callback), discards unflushed writes, including those
    /// queued before an [`end`](Self::end), and closes the stream.
    /// `on_close` does not fire for a disposed protocol.
    /// Calling it again has no effect.
    pub fn dispose(&self) {
        self.shut_down(false);
    }

    /// Dispose locally but let the writer finish.
    ///
    /// This side behaves as after [`dispose`](Self::dispose), so later
    /// sends are dropped. Messages already queued are still written, then
    /// the write side is shut down and the stream released.
    pub fn end_and_dispose(&self) {
        self.shut_down(true);
    }

    fn shut_down(&self, flush: bool) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!("Disposing connection (flush: {})", flush);

        if flush {
            self.writer.end();
        }
        self.shared.on_message.dispose();
        self.shared.on_close.dispose();

        let tasks = match self.shared.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if let Some(reader) = tasks.reader {
            reader.abort();
        }
        if let Some(writer) = tasks.writer {
            // The writer exits by itself after `End`.
            if !flush {
                writer.abort();
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        self.shared.closed_tx.send_replace(true);
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("closed", &self.is_closed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Read chunks, fire complete messages, report the close.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, writer: WriterHandle, buf_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buf_size];

    let result: Result<()> = async {
        // Anything preloaded as a first chunk goes out before the first read.
        drain_frames(&shared)?;

        while !shared.is_disposed() {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            shared.reader().extend(&buf[..n]);
            drain_frames(&shared)?;
        }
        Ok(())
    }
    .await;

    // The peer is gone; finish our side too once queued writes are out.
    writer.end();
    shared.close(result.err());
}

/// Fire every complete frame currently buffered.
fn drain_frames(shared: &Shared) -> Result<()> {
    while !shared.is_disposed() {
        // Lock released before firing so subscribers can call `buffer()`.
        let frame = shared.reader().next_frame()?;
        let Some(frame) = frame else {
            break;
        };
        let message = frame
            .into_message()
            .map_err(|e| IpcError::ProtocolViolation(format!("Invalid JSON body: {e}")))?;
        shared.on_message.fire(message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, build_frame_parts, HEADER_SIZE};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn pair() -> (Protocol, Protocol) {
        let (a, b) = duplex(64 * 1024);
        (Protocol::new(a), Protocol::new(b))
    }

    #[tokio::test]
    async fn test_text_and_json_round_trip() {
        let (left, right) = pair();
        let mut inbox = right.on_message().listen();

        left.send_text("pong");
        left.send_json(&json!({"cmd": "ping", "n": [1, 2.5, null]})).unwrap();
        left.send(Message::Json(json!("pong")));

        assert_eq!(inbox.recv().await, Some(Message::Text("pong".into())));
        assert_eq!(
            inbox.recv().await,
            Some(Message::Json(json!({"cmd": "ping", "n": [1, 2.5, null]})))
        );
        assert_eq!(inbox.recv().await, Some(Message::Json(json!("pong"))));
    }

    #[tokio::test]
    async fn test_messages_before_subscribe_are_kept() {
        let (left, right) = pair();

        left.send_text("early");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut inbox = right.on_message().listen();
        assert_eq!(inbox.recv().await, Some(Message::Text("early".into())));
    }

    #[tokio::test]
    async fn test_many_messages_keep_order() {
        let (left, right) = pair();
        let mut inbox = right.on_message().listen();

        for i in 0..500 {
            left.send_json(&i).unwrap();
        }
        for i in 0..500 {
            assert_eq!(inbox.recv().await, Some(Message::Json(json!(i))));
        }
    }

    #[tokio::test]
    async fn test_first_chunk_is_processed_without_more_data() {
        let (a, _b) = duplex(1024);
        let mut preamble = build_frame(&Message::from("one")).unwrap().to_vec();
        preamble.extend_from_slice(&build_frame(&Message::from("two")).unwrap()[..3]);

        let protocol =
            Protocol::with_first_chunk(a, Bytes::from(preamble), ProtocolConfig::default());
        let mut inbox = protocol.on_message().listen();

        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Text("one".into()))
        );
        assert_eq!(protocol.buffer().len(), 3);
    }

    #[tokio::test]
    async fn test_first_chunk_joins_stream_data() {
        let (a, mut b) = duplex(1024);
        let bytes = build_frame(&Message::from("split")).unwrap();

        let protocol = Protocol::with_first_chunk(
            a,
            bytes.slice(..4),
            ProtocolConfig::default(),
        );
        let mut inbox = protocol.on_message().listen();
        b.write_all(&bytes[4..]).await.unwrap();

        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Text("split".into()))
        );
    }

    #[tokio::test]
    async fn test_on_close_fires_once_on_peer_hangup() {
        let (a, b) = duplex(1024);
        let protocol = Protocol::new(a);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = protocol.on_close().subscribe(move |event: &CloseEvent| {
            assert!(event.is_clean());
            c.fetch_add(1, Ordering::SeqCst);
        });

        drop(b);
        timeout(WAIT, protocol.closed()).await.unwrap();

        assert!(protocol.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_closes_with_violation() {
        let (a, mut b) = duplex(1024);
        let protocol = Protocol::with_config(a, ProtocolConfig::default().max_body_size(8));
        let mut closes = protocol.on_close().listen();

        b.write_all(&Header::new(false, 9).encode()).await.unwrap();

        let event = timeout(WAIT, closes.recv()).await.unwrap().unwrap();
        let error = event.error.unwrap();
        assert!(error.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_invalid_json_body_closes_with_violation() {
        let (a, mut b) = duplex(1024);
        let protocol = Protocol::new(a);
        let mut closes = protocol.on_close().listen();

        b.write_all(&build_frame_parts(&Header::new(true, 2), b"{{"))
            .await
            .unwrap();

        let event = timeout(WAIT, closes.recv()).await.unwrap().unwrap();
        assert!(event.error.unwrap().is_protocol_violation());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_silences_on_close() {
        let (left, right) = pair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = left.on_close().subscribe(move |_: &CloseEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        left.dispose();
        left.dispose();
        left.send_text("ignored");

        timeout(WAIT, right.closed()).await.unwrap();
        assert!(left.is_disposed());
        assert!(left.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_from_message_callback_stops_draining() {
        let (a, mut b) = duplex(1024);
        let protocol = Protocol::new(a);
        let seen = Arc::new(AtomicUsize::new(0));

        let (p, s) = (protocol.clone(), seen.clone());
        let _sub = protocol.on_message().subscribe(move |_: &Message| {
            s.fetch_add(1, Ordering::SeqCst);
            p.dispose();
        });

        let mut wire = Vec::new();
        for text in ["a", "b", "c"] {
            wire.extend_from_slice(&build_frame(&Message::from(text)).unwrap());
        }
        b.write_all(&wire).await.unwrap();

        timeout(WAIT, protocol.closed()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_buffer_snapshot_inside_callback() {
        let (a, mut b) = duplex(1024);
        let protocol = Protocol::new(a);
        let snapshots = Arc::new(Mutex::new(Vec::new()));

        let (p, s) = (protocol.clone(), snapshots.clone());
        let _sub = protocol.on_message().subscribe(move |_: &Message| {
            s.lock().unwrap().push(p.buffer().len());
        });

        let mut wire = build_frame(&Message::from("x")).unwrap().to_vec();
        wire.extend_from_slice(&build_frame(&Message::from("y")).unwrap());
        wire.extend_from_slice(&[0, 0, 0]);
        b.write_all(&wire).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshots = snapshots.lock().unwrap();
        assert_eq!(*snapshots, vec![HEADER_SIZE + 1 + 3, 3]);
    }

    #[tokio::test]
    async fn test_end_and_dispose_flushes_queued_messages() {
        let (left, right) = pair();
        let mut inbox = right.on_message().listen();

        left.send_text("one");
        left.send_json(&json!({"n": 2})).unwrap();
        left.end_and_dispose();
        left.send_text("after dispose");

        assert!(left.is_disposed());
        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Text("one".into()))
        );
        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Json(json!({"n": 2})))
        );
        timeout(WAIT, right.closed()).await.unwrap();
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_oversized_outgoing_body_is_refused() {
        let (a, b) = duplex(1024);
        let left = Protocol::with_config(a, ProtocolConfig::default().max_body_size(8));
        let right = Protocol::new(b);
        let mut inbox = right.on_message().listen();

        let err = left.send_json(&"far too long for the limit").unwrap_err();
        assert!(err.is_protocol_violation());
        left.send_text("also far too long");
        left.send_text("short");

        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Text("short".into()))
        );
        assert!(!left.is_closed());
    }

    #[tokio::test]
    async fn test_end_is_graceful() {
        let (left, right) = pair();
        let mut inbox = right.on_message().listen();

        left.send_text("before end");
        left.end();

        assert_eq!(
            timeout(WAIT, inbox.recv()).await.unwrap(),
            Some(Message::Text("before end".into()))
        );
        timeout(WAIT, right.closed()).await.unwrap();
        timeout(WAIT, left.closed()).await.unwrap();
    }
}
