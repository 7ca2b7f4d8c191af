//! Channel multiplexer: named services called over one [`Protocol`](crate::Protocol).
//!
//! Provides:
//! - [`ServerChannel`] / [`CommandChannel`] - services answering calls and events
//! - [`ChannelServer`] - routes requests on one connection to channels
//! - [`ChannelClient`] - issues calls and subscriptions
//! - [`IpcServer`] / [`IpcClient`] - the above wired to a server and client
//!
//! # Example
//!
//! ```ignore
//! use ipcwire::channel::{CommandChannel, IpcClient, IpcServer};
//! use ipcwire::{Address, Server, ServerConfig};
//!
//! let server = Server::serve(address.clone(), ServerConfig::default()).await?;
//! let ipc = IpcServer::new(server);
//! ipc.register_channel(
//!     "math",
//!     CommandChannel::new().command("add", |(a, b): (i64, i64), _ctx| async move { Ok(a + b) }),
//! );
//!
//! let client = IpcClient::connect(&address, "window:1").await?;
//! let sum = client.call("math", "add", &(2, 3)).await?;
//! ```

mod client;
mod context;
mod ipc;
pub mod messages;
mod registry;
mod server;

pub use client::{ChannelClient, EventSubscription};
pub use context::ChannelContext;
pub use ipc::{IpcClient, IpcServer};
pub use registry::{BoxFuture, Command, CommandChannel, EventStream, ServerChannel, TypedCommand};
pub use server::{ChannelServer, UNKNOWN_CHANNEL_TIMEOUT};
