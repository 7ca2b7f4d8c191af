//! Connection-level wrappers: a [`Server`] whose peers get a
//! [`ChannelServer`] each, and a [`Client`] with a [`ChannelClient`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;

use super::{ChannelClient, ChannelServer, EventSubscription, ServerChannel};
use crate::client::Client;
use crate::connection::ProtocolConfig;
use crate::error::Result;
use crate::event::Subscription;
use crate::protocol::Message;
use crate::server::{ClientConnection, Server};
use crate::transport::Address;

struct Peer {
    client_id: String,
    server: ChannelServer,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Arc<dyn ServerChannel>>,
    peers: HashMap<u64, Peer>,
}

struct Inner {
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts peers on a [`Server`] and serves the registered channels to
/// each of them.
///
/// Every peer's first message is its client id (see [`Client::connect`]);
/// channel traffic starts after it.
pub struct IpcServer {
    server: Server,
    inner: Arc<Inner>,
    _on_connect: Subscription,
}

impl IpcServer {
    /// Serve channels on the peers of `server`.
    pub fn new(server: Server) -> Self {
        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry::default()),
        });

        let weak = Arc::downgrade(&inner);
        let on_connect = server
            .on_did_client_connect()
            .subscribe(move |connection: &ClientConnection| accept(&weak, connection));

        Self {
            server,
            inner,
            _on_connect: on_connect,
        }
    }

    /// Register `channel` under `name` for current and future peers.
    pub fn register_channel(&self, name: &str, channel: impl ServerChannel) {
        let channel: Arc<dyn ServerChannel> = Arc::new(channel);
        let mut registry = self.inner.registry();
        registry
            .channels
            .insert(name.to_string(), channel.clone());
        for peer in registry.peers.values() {
            peer.server.register_channel(name, channel.clone());
        }
    }

    /// Client ids of the connected peers.
    pub fn connections(&self) -> Vec<String> {
        self.inner
            .registry()
            .peers
            .values()
            .map(|peer| peer.client_id.clone())
            .collect()
    }

    /// The underlying connection server.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Stop serving and close every peer connection.
    pub fn dispose(&self) {
        let peers: Vec<Peer> = self
            .inner
            .registry()
            .peers
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        drop(peers);
        self.server.dispose();
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Wait for the peer's client id, then attach a [`ChannelServer`].
fn accept(inner: &Weak<Inner>, connection: &ClientConnection) {
    let ClientConnection { id, protocol } = connection.clone();
    let inner = inner.clone();

    protocol
        .on_message()
        .once({
            let protocol = protocol.clone();
            move |message: &Message| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let client_id = match message {
                    Message::Text(text) => text.clone(),
                    Message::Json(value) => value.to_string(),
                };
                tracing::debug!("Peer {} identified as {}", id, client_id);

                let server = ChannelServer::new(protocol.clone(), client_id.clone());
                let mut registry = inner.registry();
                for (name, channel) in &registry.channels {
                    server.register_channel(name, channel.clone());
                }
                registry.peers.insert(id, Peer { client_id, server });
                drop(registry);

                let weak = Arc::downgrade(&inner);
                tokio::spawn(async move {
                    protocol.closed().await;
                    if let Some(inner) = weak.upgrade() {
                        let peer = inner.registry().peers.remove(&id);
                        drop(peer);
                    }
                });
            }
        })
        .detach();
}

/// A [`Client`] speaking the channel protocol.
pub struct IpcClient {
    client: Client,
    channels: ChannelClient,
}

impl IpcClient {
    /// Connect to `address` as `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Connect`](crate::IpcError::Connect) if the endpoint is unreachable.
    pub async fn connect(address: &Address, client_id: &str) -> Result<Self> {
        Self::connect_with_config(address, client_id, ProtocolConfig::default()).await
    }

    /// Connect with explicit connection settings.
    pub async fn connect_with_config(
        address: &Address,
        client_id: &str,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let client = Client::connect(address, client_id, config).await?;
        let channels = ChannelClient::new(client.protocol().clone());
        Ok(Self { client, channels })
    }

    /// Wrap an already connected [`Client`].
    pub fn from_client(client: Client) -> Self {
        let channels = ChannelClient::new(client.protocol().clone());
        Self { client, channels }
    }

    /// Run `command` on the server's `channel`.
    pub async fn call<A: Serialize + ?Sized>(
        &self,
        channel: &str,
        command: &str,
        arg: &A,
    ) -> Result<Value> {
        self.channels.call(channel, command, arg).await
    }

    /// Subscribe to `event` on the server's `channel`.
    pub async fn listen<A: Serialize + ?Sized>(
        &self,
        channel: &str,
        event: &str,
        arg: &A,
    ) -> Result<EventSubscription> {
        self.channels.listen(channel, event, arg).await
    }

    /// The channel client, for sharing with other tasks.
    pub fn channel_client(&self) -> &ChannelClient {
        &self.channels
    }

    /// The underlying connection client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Close the connection.
    pub fn dispose(&self) {
        self.client.dispose();
    }
}
