//! Connection server: accepts peers and wraps each in a [`Protocol`].
//!
//! # Example
//!
//! ```ignore
//! use ipcwire::{Address, Server, ServerConfig};
//!
//! let server = Server::serve(Address::pipe("/tmp/app.sock"), ServerConfig::default()).await?;
//! let mut connections = server.on_did_client_connect().listen();
//!
//! while let Some(connection) = connections.recv().await {
//!     let mut inbox = connection.protocol.on_message().listen();
//!     tokio::spawn(async move {
//!         while let Some(message) = inbox.recv().await {
//!             connection.protocol.send(message);
//!         }
//!     });
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

use crate::connection::{Protocol, ProtocolConfig};
use crate::error::{IpcError, Result};
use crate::event::{Emitter, Event};
use crate::transport::{Address, PipeListener, SocketFile};

/// Settings for a [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Settings applied to every accepted connection.
    pub protocol: ProtocolConfig,
}

impl ServerConfig {
    /// Use `protocol` for accepted connections.
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }
}

/// One accepted peer.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Server-assigned connection number, unique per server.
    pub id: u64,
    /// The framed channel to the peer.
    pub protocol: Protocol,
}

impl ClientConnection {
    /// Resolves once this peer has disconnected.
    pub async fn disconnected(&self) {
        self.protocol.closed().await
    }
}

type Connections = Arc<Mutex<HashMap<u64, Protocol>>>;

fn lock(connections: &Mutex<HashMap<u64, Protocol>>) -> MutexGuard<'_, HashMap<u64, Protocol>> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A listening endpoint that turns every accepted stream into a [`Protocol`].
pub struct Server {
    address: Address,
    connections: Connections,
    on_connect: Arc<Emitter<ClientConnection>>,
    accept_task: JoinHandle<()>,
    socket_file: Option<Arc<SocketFile>>,
    disposed: AtomicBool,
}

impl Server {
    /// Bind `address` and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Bind`] if the endpoint cannot be bound.
    pub async fn serve(address: Address, config: ServerConfig) -> Result<Self> {
        let listener = PipeListener::bind(&address)
            .await
            .map_err(|source| IpcError::Bind {
                address: address.to_string(),
                source,
            })?;
        let address = listener.local_address().clone();
        let socket_file = listener.socket_file();
        tracing::debug!("Listening on {}", address);

        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        // Buffered so connections accepted before the first subscriber are not lost.
        let on_connect = Arc::new(Emitter::buffered());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            connections.clone(),
            on_connect.clone(),
            config.protocol,
        ));

        Ok(Self {
            address,
            connections,
            on_connect,
            accept_task,
            socket_file,
            disposed: AtomicBool::new(false),
        })
    }

    /// Fires for every accepted peer.
    pub fn on_did_client_connect(&self) -> Event<ClientConnection> {
        self.on_connect.event()
    }

    /// The bound address (with the assigned port for TCP port 0).
    pub fn local_address(&self) -> &Address {
        &self.address
    }

    /// Live connections, in no particular order.
    pub fn connections(&self) -> Vec<ClientConnection> {
        lock(&self.connections)
            .iter()
            .map(|(id, protocol)| ClientConnection {
                id: *id,
                protocol: protocol.clone(),
            })
            .collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Stop accepting, drop every live connection and release the endpoint.
    ///
    /// Calling it again has no effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Closing server on {}", self.address);

        // The aborted task drops the listener later; the path is free now.
        self.accept_task.abort();
        if let Some(socket_file) = &self.socket_file {
            socket_file.remove();
        }
        self.on_connect.dispose();

        let live: Vec<Protocol> = lock(&self.connections).drain().map(|(_, p)| p).collect();
        for protocol in live {
            protocol.dispose();
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn accept_loop(
    mut listener: PipeListener,
    connections: Connections,
    on_connect: Arc<Emitter<ClientConnection>>,
    config: ProtocolConfig,
) {
    let next_id = AtomicU64::new(1);

    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                // Per-connection failures (e.g. EMFILE) must not stop the server.
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let protocol = Protocol::with_config(stream, config.clone());
        tracing::debug!("Accepted connection {}", id);

        lock(&connections).insert(id, protocol.clone());
        let registry = connections.clone();
        let watched = protocol.clone();
        tokio::spawn(async move {
            watched.closed().await;
            lock(&registry).remove(&id);
            tracing::debug!("Connection {} closed", id);
        });

        on_connect.fire(ClientConnection { id, protocol });
    }
}
