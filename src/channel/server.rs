//! Serving side of the channel multiplexer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;

use super::messages::{Request, Response};
use super::{ChannelContext, ServerChannel};
use crate::connection::Protocol;
use crate::error::IpcError;
use crate::event::Subscription;
use crate::protocol::Message;

/// How long a request for a channel that is not registered yet waits
/// before it is answered with an error.
pub const UNKNOWN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    channels: HashMap<String, Arc<dyn ServerChannel>>,
    /// Running calls and subscriptions by request id.
    active: HashMap<u64, AbortHandle>,
    /// Requests for channels not registered yet, by channel name.
    pending: HashMap<String, Vec<Request>>,
}

struct Inner {
    protocol: Protocol,
    ctx: ChannelContext,
    state: Mutex<State>,
    subscription: Mutex<Option<Subscription>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply(&self, response: &Response) {
        if let Err(e) = self.protocol.send_json(response) {
            tracing::error!("Failed to encode channel response: {}", e);
        }
    }

    fn reply_error(&self, id: u64, error: &IpcError) {
        let message = match error {
            IpcError::Channel(message) => message.clone(),
            other => other.to_string(),
        };
        self.reply(&Response::Error { id, message });
    }

    fn abort_all(&self) {
        let active: Vec<AbortHandle> = {
            let mut state = self.state();
            state.pending.clear();
            state.active.drain().map(|(_, task)| task).collect()
        };
        for task in active {
            task.abort();
        }
    }
}

fn on_message(inner: &Weak<Inner>, message: &Message) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Message::Json(value) = message else {
        tracing::trace!("Ignoring text message on channel connection");
        return;
    };
    match serde_json::from_value::<Request>(value.clone()) {
        Ok(request) => dispatch(&inner, request),
        Err(e) => tracing::debug!("Ignoring malformed channel request: {}", e),
    }
}

fn dispatch(inner: &Arc<Inner>, request: Request) {
    match request {
        Request::Call {
            id,
            channel,
            command,
            arg,
        } => {
            let Some(service) = lookup(inner, &channel, || Request::Call {
                id,
                channel: channel.clone(),
                command: command.clone(),
                arg: arg.clone(),
            }) else {
                return;
            };
            start_call(inner, id, service, &command, arg);
        }
        Request::Listen {
            id,
            channel,
            event,
            arg,
        } => {
            let Some(service) = lookup(inner, &channel, || Request::Listen {
                id,
                channel: channel.clone(),
                event: event.clone(),
                arg: arg.clone(),
            }) else {
                return;
            };
            start_listen(inner, id, service, &event, arg);
        }
        Request::Cancel { id } | Request::Unlisten { id } => {
            let task = {
                let mut state = inner.state();
                for parked in state.pending.values_mut() {
                    parked.retain(|r| r.id() != id);
                }
                state.active.remove(&id)
            };
            if let Some(task) = task {
                tracing::trace!("Stopping channel request {}", id);
                task.abort();
            }
        }
    }
}

/// Find `channel`, or park the request until it is registered.
fn lookup(
    inner: &Arc<Inner>,
    channel: &str,
    park: impl FnOnce() -> Request,
) -> Option<Arc<dyn ServerChannel>> {
    let mut state = inner.state();
    if let Some(service) = state.channels.get(channel) {
        return Some(service.clone());
    }

    let request = park();
    let id = request.id();
    state
        .pending
        .entry(channel.to_string())
        .or_default()
        .push(request);
    drop(state);

    let weak = Arc::downgrade(inner);
    let channel = channel.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(UNKNOWN_CHANNEL_TIMEOUT).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let expired = {
            let mut state = inner.state();
            let Some(parked) = state.pending.get_mut(&channel) else {
                return;
            };
            let before = parked.len();
            parked.retain(|r| r.id() != id);
            before != parked.len()
        };
        if expired {
            tracing::debug!("No channel {} registered for request {}", channel, id);
            inner.reply_error(id, &IpcError::UnknownChannel(channel));
        }
    });
    None
}

fn start_call(
    inner: &Arc<Inner>,
    id: u64,
    service: Arc<dyn ServerChannel>,
    command: &str,
    arg: Value,
) {
    let fut = service.call(&inner.ctx, command, arg);
    let weak = Arc::downgrade(inner);

    // Held across the spawn so the task cannot finish before it is tracked.
    let mut state = inner.state();
    let task = tokio::spawn(async move {
        let result = fut.await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.state().active.remove(&id);
        match result {
            Ok(data) => inner.reply(&Response::Success { id, data }),
            Err(e) => {
                tracing::debug!("Channel call {} failed: {}", id, e);
                inner.reply_error(id, &e);
            }
        }
    });
    state.active.insert(id, task.abort_handle());
}

fn start_listen(
    inner: &Arc<Inner>,
    id: u64,
    service: Arc<dyn ServerChannel>,
    event: &str,
    arg: Value,
) {
    let mut stream = match service.listen(&inner.ctx, event, arg) {
        Ok(stream) => stream,
        Err(e) => {
            inner.reply_error(id, &e);
            return;
        }
    };
    let weak = Arc::downgrade(inner);

    let mut state = inner.state();
    let task = tokio::spawn(async move {
        while let Some(data) = stream.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.reply(&Response::Fire { id, data });
        }
        if let Some(inner) = weak.upgrade() {
            inner.state().active.remove(&id);
        }
    });
    state.active.insert(id, task.abort_handle());
}

/// Routes channel requests arriving on one [`Protocol`] to registered
/// [`ServerChannel`]s and sends their results back.
///
/// Sends `initialize` on creation. Requests naming a channel that is not
/// registered yet are held for [`UNKNOWN_CHANNEL_TIMEOUT`] in case it is
/// registered shortly after. Dropping the server stops all running calls
/// and subscriptions.
pub struct ChannelServer {
    inner: Arc<Inner>,
}

impl ChannelServer {
    /// Start serving channel requests on `protocol` for peer `client_id`.
    pub fn new(protocol: Protocol, client_id: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            protocol: protocol.clone(),
            ctx: ChannelContext::new(client_id),
            state: Mutex::new(State::default()),
            subscription: Mutex::new(None),
        });

        inner.reply(&Response::Initialize);

        let weak = Arc::downgrade(&inner);
        let subscription = protocol
            .on_message()
            .subscribe(move |message: &Message| on_message(&weak, message));
        *inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            protocol.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.abort_all();
            }
        });

        Self { inner }
    }

    /// Register `channel` under `name`, replacing any previous one, and
    /// run requests that were waiting for it.
    pub fn register_channel(&self, name: &str, channel: Arc<dyn ServerChannel>) {
        let parked = {
            let mut state = self.inner.state();
            state.channels.insert(name.to_string(), channel);
            state.pending.remove(name).unwrap_or_default()
        };
        for request in parked {
            dispatch(&self.inner, request);
        }
    }

    /// The peer this server answers.
    pub fn context(&self) -> &ChannelContext {
        &self.inner.ctx
    }

    /// The underlying connection.
    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    /// Number of calls and subscriptions currently running.
    pub fn active_requests(&self) -> usize {
        self.inner.state().active.len()
    }

    /// Stop routing requests and abort everything in flight.
    pub fn dispose(&self) {
        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);
        self.inner.abort_all();
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CommandChannel;
    use crate::event::Emitter;
    use serde_json::json;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn pair() -> (Protocol, Protocol) {
        let (a, b) = duplex(64 * 1024);
        (Protocol::new(a), Protocol::new(b))
    }

    async fn next_response(inbox: &mut crate::event::EventReceiver<Message>) -> Response {
        match timeout(WAIT, inbox.recv()).await.unwrap() {
            Some(Message::Json(value)) => serde_json::from_value(value).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    fn call(id: u64, channel: &str, command: &str, arg: Value) -> Request {
        Request::Call {
            id,
            channel: channel.into(),
            command: command.into(),
            arg,
        }
    }

    #[tokio::test]
    async fn test_initialize_then_call() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let server = ChannelServer::new(local, "client-1");
        server.register_channel(
            "math",
            Arc::new(CommandChannel::new().command("double", |n: i64, _ctx| async move { Ok(n * 2) })),
        );

        assert_eq!(next_response(&mut inbox).await, Response::Initialize);

        peer.send_json(&call(1, "math", "double", json!(21))).unwrap();
        assert_eq!(
            next_response(&mut inbox).await,
            Response::Success { id: 1, data: json!(42) }
        );
    }

    #[tokio::test]
    async fn test_failed_call_reports_message() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let server = ChannelServer::new(local, "c");
        server.register_channel(
            "svc",
            Arc::new(CommandChannel::new().command("fail", |_: (), _ctx| async move {
                Err::<(), _>(IpcError::Channel("boom".into()))
            })),
        );
        next_response(&mut inbox).await;

        peer.send_json(&call(5, "svc", "fail", Value::Null)).unwrap();
        assert_eq!(
            next_response(&mut inbox).await,
            Response::Error { id: 5, message: "boom".into() }
        );
    }

    #[tokio::test]
    async fn test_late_registration_runs_parked_call() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let server = ChannelServer::new(local, "c");
        next_response(&mut inbox).await;

        peer.send_json(&call(1, "late", "ping", Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        server.register_channel(
            "late",
            Arc::new(CommandChannel::new().command("ping", |_: (), _ctx| async move { Ok("pong") })),
        );

        assert_eq!(
            next_response(&mut inbox).await,
            Response::Success { id: 1, data: json!("pong") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_channel_times_out() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let _server = ChannelServer::new(local, "c");
        next_response(&mut inbox).await;

        peer.send_json(&call(2, "ghost", "x", Value::Null)).unwrap();
        match next_response(&mut inbox).await {
            Response::Error { id, message } => {
                assert_eq!(id, 2);
                assert!(message.contains("ghost"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_call() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let server = ChannelServer::new(local, "c");
        server.register_channel(
            "slow",
            Arc::new(CommandChannel::new().command("wait", |_: (), _ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })),
        );
        next_response(&mut inbox).await;

        peer.send_json(&call(7, "slow", "wait", Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.active_requests(), 1);

        peer.send_json(&Request::Cancel { id: 7 }).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.active_requests(), 0);
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_listen_forwards_until_unlisten() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let ticks = Emitter::new();
        let server = ChannelServer::new(local, "c");
        server.register_channel("clock", Arc::new(CommandChannel::new().event("tick", ticks.event())));
        next_response(&mut inbox).await;

        peer.send_json(&Request::Listen {
            id: 3,
            channel: "clock".into(),
            event: "tick".into(),
            arg: Value::Null,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        ticks.fire(json!(1));
        assert_eq!(
            next_response(&mut inbox).await,
            Response::Fire { id: 3, data: json!(1) }
        );

        peer.send_json(&Request::Unlisten { id: 3 }).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        ticks.fire(json!(2));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(inbox.try_recv().is_none());
        assert_eq!(server.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_connection_close_aborts_requests() {
        let (peer, local) = pair();
        let mut inbox = peer.on_message().listen();
        let server = ChannelServer::new(local, "c");
        server.register_channel(
            "slow",
            Arc::new(CommandChannel::new().command("wait", |_: (), _ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })),
        );
        next_response(&mut inbox).await;
        peer.send_json(&call(1, "slow", "wait", Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        peer.dispose();
        timeout(WAIT, server.protocol().closed()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.active_requests(), 0);
    }
}
