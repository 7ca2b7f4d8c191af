//! Publish/subscribe events.
//!
//! An [`Emitter`] owns the listener list and fires values; an [`Event`] is
//! the subscriber-facing handle handed out by connections and servers.
//! Every subscriber sees every value fired after it subscribed.
//! [`Subscription`] unsubscribes on drop.
//!
//! A buffered emitter queues values fired while nobody is listening and
//! replays them, in order, to the first subscriber. Connections use this so
//! that messages arriving between accept and the first `subscribe` are not
//! lost.
//!
//! # Example
//!
//! ```
//! use ipcwire::event::Emitter;
//! use std::sync::{Arc, Mutex};
//!
//! let emitter = Emitter::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = seen.clone();
//! let subscription = emitter.event().subscribe(move |v: &u32| sink.lock().unwrap().push(*v));
//!
//! emitter.fire(1);
//! drop(subscription);
//! emitter.fire(2);
//!
//! assert_eq!(*seen.lock().unwrap(), vec![1]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    listeners: Vec<(u64, Callback<T>)>,
    next_id: u64,
    /// Values waiting for delivery, either because nobody listens yet
    /// (buffered mode) or because a replay is in progress.
    queue: VecDeque<T>,
    buffered: bool,
    replaying: bool,
    disposed: bool,
}

type Shared<T> = Arc<Mutex<Inner<T>>>;

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner side of an event: fires values to all current subscribers.
pub struct Emitter<T> {
    inner: Shared<T>,
}

impl<T: Send + 'static> Emitter<T> {
    /// Create an emitter that drops values fired while nobody listens.
    pub fn new() -> Self {
        Self::with_buffering(false)
    }

    /// Create an emitter that keeps values fired while nobody listens and
    /// replays them to the first subscriber.
    pub fn buffered() -> Self {
        Self::with_buffering(true)
    }

    fn with_buffering(buffered: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                listeners: Vec::new(),
                next_id: 0,
                queue: VecDeque::new(),
                buffered,
                replaying: false,
                disposed: false,
            })),
        }
    }

    /// Subscriber-facing handle for this emitter.
    pub fn event(&self) -> Event<T> {
        Event {
            inner: self.inner.clone(),
        }
    }

    /// Deliver `value` to every subscriber.
    ///
    /// Listeners run on the calling task without any lock held, so a
    /// listener may subscribe, unsubscribe or dispose re-entrantly.
    pub fn fire(&self, value: T) {
        let listeners = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return;
            }
            if inner.replaying || (inner.listeners.is_empty() && inner.buffered) {
                inner.queue.push_back(value);
                return;
            }
            snapshot(&inner)
        };
        for listener in listeners {
            listener(&value);
        }
    }

    /// Number of current subscribers.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Drop every subscriber and any queued values. Later fires are ignored.
    pub fn dispose(&self) {
        let (listeners, queue) = {
            let mut inner = lock(&self.inner);
            inner.disposed = true;
            (
                std::mem::take(&mut inner.listeners),
                std::mem::take(&mut inner.queue),
            )
        };
        // Dropped outside the lock: a listener's captures may run arbitrary Drop code.
        drop(listeners);
        drop(queue);
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        lock(&self.inner).disposed
    }
}

impl<T: Send + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot<T>(inner: &Inner<T>) -> Vec<Callback<T>> {
    inner.listeners.iter().map(|(_, l)| l.clone()).collect()
}

fn remove_listener<T>(inner: &Mutex<Inner<T>>, id: u64) {
    let removed = {
        let mut inner = lock(inner);
        inner
            .listeners
            .iter()
            .position(|(i, _)| *i == id)
            .map(|pos| inner.listeners.remove(pos))
    };
    // Dropped outside the lock, like in `dispose`.
    drop(removed);
}

/// Subscriber side of an event.
pub struct Event<T> {
    inner: Shared<T>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Event<T> {
    /// Register `listener`; it stays registered until the returned
    /// [`Subscription`] is dropped or the emitter is disposed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(|_| {
            let callback: Callback<T> = Arc::new(listener);
            callback
        })
    }

    /// Register `listener` for the next value only.
    ///
    /// On a buffered emitter, values queued behind that one stay queued for
    /// the next subscriber.
    pub fn once<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let slot = Mutex::new(Some(listener));
        let inner = Arc::downgrade(&self.inner);
        self.register(move |id| {
            let callback: Callback<T> = Arc::new(move |value: &T| {
                let listener = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(inner) = inner.upgrade() {
                    remove_listener(&inner, id);
                }
                if let Some(listener) = listener {
                    listener(value);
                }
            });
            callback
        })
    }

    fn register(&self, make: impl FnOnce(u64) -> Callback<T>) -> Subscription {
        let (id, replay) = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return Subscription::inert();
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, make(id)));
            let replay = inner.listeners.len() == 1 && !inner.queue.is_empty() && !inner.replaying;
            if replay {
                inner.replaying = true;
            }
            (id, replay)
        };

        if replay {
            self.replay();
        }

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    remove_listener(&inner, id);
                }
            })),
        }
    }

    /// Deliver queued values one by one. Values fired meanwhile join the
    /// queue, which keeps delivery in firing order. Stops early, keeping
    /// the rest queued, once the last listener is gone.
    fn replay(&self) {
        loop {
            let (value, listeners) = {
                let mut inner = lock(&self.inner);
                let next = if inner.disposed || inner.listeners.is_empty() {
                    None
                } else {
                    inner.queue.pop_front()
                };
                match next {
                    Some(value) => (value, snapshot(&inner)),
                    None => {
                        inner.replaying = false;
                        return;
                    }
                }
            };
            for listener in listeners {
                listener(&value);
            }
        }
    }
}

impl<T: Clone + Send + 'static> Event<T> {
    /// Subscribe with a channel instead of a callback.
    ///
    /// The receiver yields every value fired from now on and returns `None`
    /// once the emitter is disposed.
    pub fn listen(&self) -> EventReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        EventReceiver {
            rx,
            _subscription: subscription,
        }
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn inert() -> Self {
        Self { unsubscribe: None }
    }

    /// Unsubscribe now. Same as dropping.
    pub fn dispose(mut self) {
        self.run();
    }

    /// Keep the listener registered for the emitter's whole lifetime.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }

    fn run(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Channel-backed subscription created by [`Event::listen`].
pub struct EventReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> EventReceiver<T> {
    /// Wait for the next value. `None` once the emitter is disposed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a value if one is already waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
