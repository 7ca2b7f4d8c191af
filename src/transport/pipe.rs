//! Platform-specific listener and stream implementation.
//!
//! - TCP everywhere
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use ipcwire::transport::{connect, generate_pipe_path, Address, PipeListener};
//!
//! let address = Address::Pipe(generate_pipe_path("demo"));
//! let mut listener = PipeListener::bind(&address).await?;
//! let client = connect(&address).await?;
//! let server_side = listener.accept().await?;
//! ```

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use super::Address;

/// A connected byte stream of any supported transport.
#[derive(Debug)]
pub enum PipeStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// Server end of a named pipe.
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
    /// Client end of a named pipe.
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self.get_mut() {
            PipeStream::Tcp($inner) => $call,
            #[cfg(unix)]
            PipeStream::Unix($inner) => $call,
            #[cfg(windows)]
            PipeStream::PipeServer($inner) => $call,
            #[cfg(windows)]
            PipeStream::PipeClient($inner) => $call,
        }
    };
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

/// Connect to a listening endpoint.
pub async fn connect(address: &Address) -> io::Result<PipeStream> {
    match address {
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(PipeStream::Tcp(stream))
        }
        #[cfg(unix)]
        Address::Pipe(path) => Ok(PipeStream::Unix(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(windows)]
        Address::Pipe(path) => {
            let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
            Ok(PipeStream::PipeClient(client))
        }
        #[cfg(not(any(unix, windows)))]
        Address::Pipe(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "pipe addresses are not supported on this platform",
        )),
    }
}

// ============================================================================
// Listener
// ============================================================================

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    #[cfg(windows)]
    Pipe(tokio::net::windows::named_pipe::NamedPipeServer),
}

/// The filesystem entry of a bound Unix socket, removed at most once.
///
/// Shared between a listener and its owner so the path can be released
/// as soon as the owner is done, not whenever the listener is dropped.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
    removed: AtomicBool,
}

impl SocketFile {
    #[cfg_attr(not(unix), allow(dead_code))]
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: AtomicBool::new(false),
        }
    }

    /// Delete the socket file. Later calls do nothing, so a path that was
    /// bound again in the meantime is left alone.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::debug!("Failed to remove {}: {}", self.path.display(), e);
            }
            _ => {}
        }
    }
}

/// A bound endpoint accepting connections.
pub struct PipeListener {
    inner: Inner,
    address: Address,
    socket_file: Option<Arc<SocketFile>>,
}

impl PipeListener {
    /// Bind to `address`.
    ///
    /// For a Unix socket path that already exists, a live listener behind it
    /// yields `AddrInUse`; a stale socket file left by a dead process is
    /// removed and the bind proceeds.
    pub async fn bind(address: &Address) -> io::Result<Self> {
        match address {
            Address::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let local = listener.local_addr()?;
                Ok(Self {
                    inner: Inner::Tcp(listener),
                    address: Address::tcp(host.clone(), local.port()),
                    socket_file: None,
                })
            }
            #[cfg(unix)]
            Address::Pipe(path) => {
                if path.exists() {
                    if tokio::net::UnixStream::connect(path).await.is_ok() {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("{} is already being served", path.display()),
                        ));
                    }
                    match std::fs::remove_file(path) {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                        _ => {}
                    }
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Self {
                    inner: Inner::Unix(listener),
                    address: address.clone(),
                    socket_file: Some(Arc::new(SocketFile::new(path.clone()))),
                })
            }
            #[cfg(windows)]
            Address::Pipe(path) => {
                let server = tokio::net::windows::named_pipe::ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(path)?;
                Ok(Self {
                    inner: Inner::Pipe(server),
                    address: address.clone(),
                    socket_file: None,
                })
            }
            #[cfg(not(any(unix, windows)))]
            Address::Pipe(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "pipe addresses are not supported on this platform",
            )),
        }
    }

    /// Accept a single connection.
    pub async fn accept(&mut self) -> io::Result<PipeStream> {
        match &mut self.inner {
            Inner::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(PipeStream::Tcp(stream))
            }
            #[cfg(unix)]
            Inner::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(PipeStream::Unix(stream))
            }
            #[cfg(windows)]
            Inner::Pipe(server) => {
                server.connect().await?;
                // Hand out the connected instance, keep a fresh one listening.
                let next = tokio::net::windows::named_pipe::ServerOptions::new()
                    .create(self.address.as_pipe().unwrap_or(std::path::Path::new("")))?;
                let connected = std::mem::replace(server, next);
                Ok(PipeStream::PipeServer(connected))
            }
        }
    }

    /// The bound address. For TCP port 0 this carries the assigned port.
    pub fn local_address(&self) -> &Address {
        &self.address
    }

    /// The socket file backing this listener, for Unix socket addresses.
    pub fn socket_file(&self) -> Option<Arc<SocketFile>> {
        self.socket_file.clone()
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        if let Some(socket_file) = &self.socket_file {
            socket_file.remove();
        }
    }
}
