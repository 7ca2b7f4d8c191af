//! Dedicated writer task that coalesces outgoing frames.
//!
//! Senders push frames onto an unbounded channel without waiting. The
//! writer task wakes on the next scheduler tick, drains everything queued
//! so far, concatenates it and issues a single write. Frames sent back to
//! back from the same task therefore share one syscall, and frames from
//! concurrent senders never interleave mid-frame.
//!
//! # Architecture
//!
//! ```text
//! Protocol::send ─┐
//! Channel server ─┼─► mpsc::UnboundedSender<Command> ─► Writer Task ─► Socket
//! Channel client ─┘
//! ```
//!
//! No acknowledgement from the socket is awaited by senders; the transport
//! buffers beyond this point.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum frames to batch in a single write operation.
pub const DEFAULT_MAX_BATCH_FRAMES: usize = 256;

/// A frame ready to be written to the socket.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header (5 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body bytes.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, body: Bytes) -> Self {
        Self {
            header: header.encode(),
            body,
        }
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Work items for the writer task.
#[derive(Debug)]
enum Command {
    Frame(OutboundFrame),
    /// Write what is queued, then half-close the stream.
    End,
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Upper bound on frames merged into one write.
    pub max_batch_frames: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_frames: DEFAULT_MAX_BATCH_FRAMES,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl WriterHandle {
    /// Queue a frame for the next flush.
    ///
    /// Never blocks. If the writer task has already stopped (stream closed
    /// or disposed), the frame is dropped silently: writes racing a close
    /// are expected.
    pub fn send(&self, frame: OutboundFrame) {
        if self.tx.send(Command::Frame(frame)).is_err() {
            tracing::trace!("Dropping frame written after close");
        }
    }

    /// Flush queued frames, then shut down the write half of the stream.
    pub fn end(&self) {
        let _ = self.tx.send(Command::End);
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)`; the task finishes after
/// [`WriterHandle::end`], when every handle is dropped, or on the first
/// write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, config.max_batch_frames.max(1)).await;
        if let Err(e) = &result {
            tracing::debug!("Writer stopped: {}", e);
        }
        result
    });

    (WriterHandle { tx }, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives frames and writes them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut writer: W,
    max_batch_frames: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(command) => command,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(16);
        let mut end = false;
        match first {
            Command::Frame(frame) => batch.push(frame),
            Command::End => end = true,
        }

        // Collect everything already queued (non-blocking)
        while !end && batch.len() < max_batch_frames {
            match rx.try_recv() {
                Ok(Command::Frame(frame)) => batch.push(frame),
                Ok(Command::End) => end = true,
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;

        if end {
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Concatenate a batch of frames and write it with one call.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let buf = concat_frames(batch);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Concatenate `[header, body]*` into one contiguous buffer.
fn concat_frames(batch: &[OutboundFrame]) -> Bytes {
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut buf = BytesMut::with_capacity(total_size);
    for frame in batch {
        buf.extend_from_slice(&frame.header);
        buf.extend_from_slice(&frame.body);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Message};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame_of(message: &Message) -> OutboundFrame {
        let (header, body) = message.encode().unwrap();
        OutboundFrame::new(&header, body)
    }

    /// Records each `poll_write` call as a separate entry.
    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        shutdown: Arc<Mutex<bool>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            *self.shutdown.lock().unwrap() = true;
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_outbound_frame_creation() {
        let frame = frame_of(&Message::from("hello"));

        assert_eq!(frame.header, [0, 0, 0, 0, 5]);
        assert_eq!(frame.body.len(), 5);
        assert_eq!(frame.size(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_batch_frames, DEFAULT_MAX_BATCH_FRAMES);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.send(frame_of(&Message::from("hello")));

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_back_to_back_sends_share_one_write() {
        let recorder = RecordingWriter::default();
        let (handle, task) = spawn_writer_task_default(recorder.clone());

        handle.send(frame_of(&Message::from("a")));
        handle.send(frame_of(&Message::Json(serde_json::json!({"b": 2}))));
        drop(handle);
        task.await.unwrap().unwrap();

        let writes = recorder.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);

        let frames = FrameBuffer::new().push(&writes[0]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body(), b"a");
        assert_eq!(frames[1].body(), br#"{"b":2}"#);
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let recorder = RecordingWriter::default();
        let config = WriterConfig { max_batch_frames: 2 };
        let (handle, task) = spawn_writer_task(recorder.clone(), config);

        for i in 0..5 {
            handle.send(frame_of(&Message::from(i.to_string())));
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let writes = recorder.writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        let bodies: Vec<Vec<u8>> = writes
            .iter()
            .flat_map(|w| FrameBuffer::new().push(w).unwrap())
            .map(|f| f.body.to_vec())
            .collect();
        assert_eq!(bodies, vec![b"0", b"1", b"2", b"3", b"4"]);
    }

    #[tokio::test]
    async fn test_end_flushes_then_shuts_down() {
        let recorder = RecordingWriter::default();
        let (handle, task) = spawn_writer_task_default(recorder.clone());

        handle.send(frame_of(&Message::from("last")));
        handle.end();
        task.await.unwrap().unwrap();

        assert_eq!(recorder.writes.lock().unwrap().len(), 1);
        assert!(*recorder.shutdown.lock().unwrap());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task_default(client);

        handle.end();
        task.await.unwrap().unwrap();

        // Must not panic or error
        handle.send(frame_of(&Message::from("late")));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_stops_task() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task_default(client);

        handle.send(frame_of(&Message::from("nobody reads this")));

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5).map(|_| frame_of(&Message::from("abc"))).collect();
        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
