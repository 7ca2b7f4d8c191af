//! Transport module - endpoints, listeners and connected streams.
//!
//! Provides abstraction over:
//! - TCP sockets
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)

mod address;
mod pipe;

pub use address::{generate_pipe_path, Address};
pub use pipe::{connect, PipeListener, PipeStream, SocketFile};
