//! # ipcwire
//!
//! Length-prefixed message framing over local byte streams, with a
//! channel multiplexer on top.
//!
//! Every message travels as one frame:
//!
//! ```text
//! ┌──────┬──────────────────┬─────────────────────┐
//! │ flag │ body length (BE) │ body (UTF-8)        │
//! │ 1 B  │ 4 B              │ body length bytes   │
//! └──────┴──────────────────┴─────────────────────┘
//! flag 1 = JSON body, flag 0 = plain text body
//! ```
//!
//! ## Architecture
//!
//! - **Transport**: TCP, Unix domain sockets, Windows named pipes
//! - **Protocol**: framing, buffered message events and write coalescing per connection
//! - **Server / Client**: accept or establish connections (with bounded retry)
//! - **Channels**: named services with calls and event subscriptions
//! - **Sync**: three-way merges for settings, extensions and snippets
//!
//! ## Example
//!
//! ```ignore
//! use ipcwire::{generate_pipe_path, Address, Client, Message, ProtocolConfig, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> ipcwire::Result<()> {
//!     let address = Address::Pipe(generate_pipe_path("demo"));
//!     let server = Server::serve(address.clone(), ServerConfig::default()).await?;
//!     let mut peers = server.on_did_client_connect().listen();
//!
//!     let client = Client::connect(&address, "demo-client", ProtocolConfig::default()).await?;
//!     client.protocol().send_json(&serde_json::json!({"cmd": "ping"}))?;
//!
//!     let peer = peers.recv().await.expect("server running");
//!     let mut inbox = peer.protocol.on_message().listen();
//!     assert_eq!(inbox.recv().await, Some(Message::from("demo-client")));
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transport;
pub mod writer;

pub use client::{connect_with_retry, Client, RetryConfig, Terminate};
pub use connection::{CloseEvent, Protocol, ProtocolConfig};
pub use error::{IpcError, Result};
pub use event::{Event, EventReceiver, Subscription};
pub use protocol::Message;
pub use server::{ClientConnection, Server, ServerConfig};
pub use transport::{generate_pipe_path, Address};
