//! Calling side of the channel multiplexer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::messages::{Request, Response};
use crate::codec::JsonCodec;
use crate::connection::Protocol;
use crate::error::{IpcError, Result};
use crate::event::Subscription;
use crate::protocol::Message;

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Listen(mpsc::UnboundedSender<Value>),
}

struct Inner {
    protocol: Protocol,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: Mutex<u64>,
    initialized: watch::Sender<bool>,
    _subscription: Mutex<Option<Subscription>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }

    fn handle(&self, response: Response) {
        match response {
            Response::Initialize => {
                tracing::trace!("Channel server initialized");
                self.initialized.send_replace(true);
            }
            Response::Success { id, data } => {
                if let Some(Pending::Call(tx)) = self.pending().remove(&id) {
                    let _ = tx.send(Ok(data));
                }
            }
            Response::Error { id, message } => match self.pending().remove(&id) {
                Some(Pending::Call(tx)) => {
                    let _ = tx.send(Err(IpcError::Channel(message)));
                }
                Some(Pending::Listen(_)) => {
                    tracing::debug!("Subscription {} rejected: {}", id, message);
                }
                None => {}
            },
            Response::Fire { id, data } => {
                if let Some(Pending::Listen(tx)) = self.pending().get(&id) {
                    let _ = tx.send(data);
                }
            }
        }
    }

    /// Fail every pending call and end every subscription.
    fn fail_all(&self) {
        let pending: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for entry in pending {
            if let Pending::Call(tx) = entry {
                let _ = tx.send(Err(IpcError::ConnectionClosed));
            }
        }
    }

    /// Forget request `id`; tell the server if it was still running.
    fn abandon(&self, id: u64, stop: Request) {
        if self.pending().remove(&id).is_some() && !self.protocol.is_closed() {
            let _ = self.protocol.send_json(&stop);
        }
    }
}

fn on_message(inner: &Weak<Inner>, message: &Message) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Message::Json(value) = message else {
        return;
    };
    match serde_json::from_value::<Response>(value.clone()) {
        Ok(response) => inner.handle(response),
        Err(e) => tracing::debug!("Ignoring malformed channel response: {}", e),
    }
}

/// Sends `cancel` if the call future is dropped before it resolves.
struct CancelOnDrop<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.inner.abandon(self.id, Request::Cancel { id: self.id });
    }
}

/// Issues calls and subscriptions to a [`ChannelServer`](super::ChannelServer)
/// on the other end of a [`Protocol`].
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl ChannelClient {
    /// Start routing channel responses arriving on `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        let (initialized, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            protocol: protocol.clone(),
            pending: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            initialized,
            _subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = protocol
            .on_message()
            .subscribe(move |message: &Message| on_message(&weak, message));
        *inner
            ._subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            protocol.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.fail_all();
            }
        });

        Self { inner }
    }

    /// Wait for the server's `initialize`.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] if the connection closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.initialized.subscribe();
        tokio::select! {
            ready = rx.wait_for(|ready| *ready) => ready.map(|_| ()).map_err(|_| IpcError::ConnectionClosed),
            _ = self.inner.protocol.closed() => Err(IpcError::ConnectionClosed),
        }
    }

    /// Run `command` on `channel` and wait for its result.
    ///
    /// Dropping the returned future before it resolves cancels the call on
    /// the server.
    ///
    /// # Errors
    ///
    /// [`IpcError::Channel`] with the server's message if the call failed,
    /// [`IpcError::ConnectionClosed`] if the connection went away.
    pub async fn call<A: Serialize + ?Sized>(
        &self,
        channel: &str,
        command: &str,
        arg: &A,
    ) -> Result<Value> {
        let arg = JsonCodec::to_value(arg)?;
        self.ready().await?;

        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.track(id, Pending::Call(tx))?;
        let _guard = CancelOnDrop {
            inner: &self.inner,
            id,
        };

        self.inner.protocol.send_json(&Request::Call {
            id,
            channel: channel.to_string(),
            command: command.to_string(),
            arg,
        })?;

        rx.await.unwrap_or(Err(IpcError::ConnectionClosed))
    }

    /// Subscribe to `event` on `channel`.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] if the connection closes before the
    /// server is ready.
    pub async fn listen<A: Serialize + ?Sized>(
        &self,
        channel: &str,
        event: &str,
        arg: &A,
    ) -> Result<EventSubscription> {
        let arg = JsonCodec::to_value(arg)?;
        self.ready().await?;

        let id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.track(id, Pending::Listen(tx))?;
        let subscription = EventSubscription {
            inner: self.inner.clone(),
            id,
            rx,
        };

        self.inner.protocol.send_json(&Request::Listen {
            id,
            channel: channel.to_string(),
            event: event.to_string(),
            arg,
        })?;
        Ok(subscription)
    }

    fn track(&self, id: u64, entry: Pending) -> Result<()> {
        self.inner.pending().insert(id, entry);
        // Inserted after the close sweep ran; nobody else will fail it.
        if self.inner.protocol.is_closed() {
            self.inner.pending().remove(&id);
            return Err(IpcError::ConnectionClosed);
        }
        Ok(())
    }

    /// The underlying connection.
    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    /// Number of calls and subscriptions awaiting responses.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }
}

/// A live `listen` subscription. Dropping it sends `unlisten`.
pub struct EventSubscription {
    inner: Arc<Inner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventSubscription {
    /// Next event value. `None` once the server rejected the subscription
    /// or the connection closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.inner
            .abandon(self.id, Request::Unlisten { id: self.id });
    }
}
