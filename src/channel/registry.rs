//! Channel trait and a command registry implementing it.
//!
//! A [`ServerChannel`] answers calls and hands out event streams for one
//! channel name. [`CommandChannel`] is the usual implementation: it maps
//! command names to typed async handlers and event names to [`Event`]s.
//!
//! # Example
//!
//! ```ignore
//! use ipcwire::channel::CommandChannel;
//! use ipcwire::event::Emitter;
//!
//! let progress = Emitter::new();
//! let channel = CommandChannel::new()
//!     .command("echo", |text: String, _ctx| async move { Ok(text) })
//!     .command("add", |(a, b): (i64, i64), _ctx| async move { Ok(a + b) })
//!     .event("progress", progress.event());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ChannelContext;
use crate::error::{IpcError, Result};
use crate::event::{Event, EventReceiver};

/// Boxed future returned by channel calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Values delivered to one `listen` subscription.
pub type EventStream = EventReceiver<Value>;

/// A named service reachable over a [`ChannelServer`](super::ChannelServer).
pub trait ServerChannel: Send + Sync + 'static {
    /// Run `command` with `arg`.
    fn call(&self, ctx: &ChannelContext, command: &str, arg: Value)
        -> BoxFuture<'static, Result<Value>>;

    /// Subscribe to `event`. The subscription ends when the stream is
    /// dropped.
    fn listen(&self, ctx: &ChannelContext, event: &str, arg: Value) -> Result<EventStream>;
}

/// One command of a [`CommandChannel`].
pub trait Command: Send + Sync + 'static {
    /// Run the command with a raw JSON argument.
    fn call(&self, arg: Value, ctx: ChannelContext) -> BoxFuture<'static, Result<Value>>;
}

/// Wrapper that deserializes the argument and serializes the result around
/// a typed handler.
pub struct TypedCommand<F, T, R, Fut>
where
    F: Fn(T, ChannelContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedCommand<F, T, R, Fut>
where
    F: Fn(T, ChannelContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed command.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Command for TypedCommand<F, T, R, Fut>
where
    F: Fn(T, ChannelContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, arg: Value, ctx: ChannelContext) -> BoxFuture<'static, Result<Value>> {
        let parsed: T = match serde_json::from_value(arg) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(IpcError::Json(e)) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        })
    }
}

/// A [`ServerChannel`] built from named commands and events.
#[derive(Default)]
pub struct CommandChannel {
    commands: HashMap<String, Box<dyn Command>>,
    events: HashMap<String, Event<Value>>,
}

impl CommandChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command handler. Registering a name twice replaces the first.
    pub fn command<F, T, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T, ChannelContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.commands
            .insert(name.to_string(), Box::new(TypedCommand::new(handler)));
        self
    }

    /// Expose `event` under `name`.
    pub fn event(mut self, name: &str, event: Event<Value>) -> Self {
        self.events.insert(name.to_string(), event);
        self
    }

    /// Whether a command named `name` exists.
    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Whether an event named `name` exists.
    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }
}

impl ServerChannel for CommandChannel {
    fn call(
        &self,
        ctx: &ChannelContext,
        command: &str,
        arg: Value,
    ) -> BoxFuture<'static, Result<Value>> {
        match self.commands.get(command) {
            Some(handler) => handler.call(arg, ctx.clone()),
            None => {
                let err = IpcError::Channel(format!("Unknown command: {command}"));
                Box::pin(async move { Err(err) })
            }
        }
    }

    fn listen(&self, _ctx: &ChannelContext, event: &str, _arg: Value) -> Result<EventStream> {
        self.events
            .get(event)
            .map(Event::listen)
            .ok_or_else(|| IpcError::Channel(format!("Unknown event: {event}")))
    }
}
