//! Typed pub/sub between the pipeline and consumer callbacks.
//!
//! A [`Dispatcher`] keeps a registry of listeners per [`Channel`] and
//! supports two emission strategies, selected at emitter construction:
//!
//! - **parallel fan-out** (default): every listener is invoked in
//!   registration order but its future is spawned, not awaited; one slow
//!   or failing listener never blocks the others.
//! - **serial listeners**: listeners are awaited in registration order; a
//!   failure stops the chain for that event only.
//!
//! Listener failures are routed to the `error` channel in both modes.
//! Subscribing returns a [`Subscription`] handle whose drop unsubscribes,
//! which also drives the auto-start lifecycle of
//! [`AutoEventsEmitter`](crate::AutoEventsEmitter).

mod subscription;

pub use subscription::Subscription;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{error, trace};

use crate::{
    EmitterError,
    types::{Channel, EmitterEvent},
};

/// Error type returned by listener callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// The future a listener callback returns.
pub type ListenerFuture = BoxFuture<'static, Result<(), ListenerError>>;

type Listener = Arc<dyn Fn(EmitterEvent) -> ListenerFuture + Send + Sync>;

struct Registered {
    id: u64,
    listener: Listener,
}

pub(crate) struct DispatcherInner {
    serial_listeners: bool,
    next_id: AtomicU64,
    channels: Mutex<HashMap<Channel, Vec<Registered>>>,
    new_event_count: watch::Sender<usize>,
}

impl DispatcherInner {
    pub(crate) fn unsubscribe(&self, channel: Channel, id: u64) {
        let mut channels = self.channels.lock().expect("dispatcher mutex poisoned");
        if let Some(listeners) = channels.get_mut(&channel) {
            listeners.retain(|registered| registered.id != id);
            if channel == Channel::NewEvent {
                self.new_event_count.send_replace(listeners.len());
            }
        }
    }
}

/// Subscriber registry and emission strategy. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(serial_listeners: bool) -> Self {
        let (new_event_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(DispatcherInner {
                serial_listeners,
                next_id: AtomicU64::new(0),
                channels: Mutex::new(HashMap::new()),
                new_event_count,
            }),
        }
    }

    /// Registers a listener on a channel.
    ///
    /// The returned handle unsubscribes on drop; hold it for as long as
    /// events should be delivered.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, channel: Channel, listener: F) -> Subscription
    where
        F: Fn(EmitterEvent) -> ListenerFuture + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.inner.channels.lock().expect("dispatcher mutex poisoned");
        let listeners = channels.entry(channel).or_default();
        listeners.push(Registered { id, listener: Arc::new(listener) });

        if channel == Channel::NewEvent {
            self.inner.new_event_count.send_replace(listeners.len());
        }
        trace!(channel = ?channel, id, "listener subscribed");

        Subscription::new(channel, id, Arc::downgrade(&self.inner))
    }

    /// Number of listeners currently registered on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .channels
            .lock()
            .expect("dispatcher mutex poisoned")
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Watches the `newEvent` subscriber count; drives auto-start.
    pub(crate) fn new_event_subscribers(&self) -> watch::Receiver<usize> {
        self.inner.new_event_count.subscribe()
    }

    /// Delivers an event to its channel's listeners.
    ///
    /// With serial listeners the call returns after every listener ran;
    /// otherwise it returns once all listener futures are scheduled.
    pub async fn emit(&self, event: EmitterEvent) {
        let listeners = self.listeners_for(event.channel());
        if listeners.is_empty() {
            return;
        }

        if self.inner.serial_listeners {
            for listener in listeners {
                if let Err(err) = listener(event.clone()).await {
                    self.route_listener_failure(&event, &err);
                    // failure stops the chain for this event only
                    break;
                }
            }
        } else {
            for listener in listeners {
                let event = event.clone();
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = listener(event.clone()).await {
                        dispatcher.route_listener_failure(&event, &err);
                    }
                });
            }
        }
    }

    /// Delivers a pipeline failure on the `error` channel.
    ///
    /// Error listeners are always spawned so a failing pipeline never
    /// waits on its own observers; their failures are only logged, never
    /// re-dispatched.
    pub(crate) fn dispatch_error(&self, error: EmitterError) {
        let listeners = self.listeners_for(Channel::Error);
        if listeners.is_empty() {
            return;
        }

        let event = EmitterEvent::Error(error);
        for listener in listeners {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = listener(event).await {
                    error!(error = %err, "error-channel listener failed");
                }
            });
        }
    }

    fn route_listener_failure(&self, event: &EmitterEvent, err: &ListenerError) {
        error!(channel = ?event.channel(), error = %err, "listener failed");
        if event.channel() != Channel::Error {
            self.dispatch_error(EmitterError::Listener(err.to_string().into()));
        }
    }

    fn listeners_for(&self, channel: Channel) -> Vec<Listener> {
        self.inner
            .channels
            .lock()
            .expect("dispatcher mutex poisoned")
            .get(&channel)
            .map(|listeners| listeners.iter().map(|r| r.listener.clone()).collect())
            .unwrap_or_default()
    }
}
