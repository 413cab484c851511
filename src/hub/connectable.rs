//! Streams whose upstream subscription is started explicitly.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::invariant::ProtocolViolation;
use crate::invariant;
use crate::stream::{EventEmitter, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};
use crate::stream::protocol::Downstream;
use crate::tracing_compat::debug;

use super::Hub;

type HubFactory<T> = Box<dyn Fn() -> Hub<T>>;

struct Connection<T> {
    upstream: Stream<T>,
    factory: HubFactory<T>,
    hub: RefCell<Option<Hub<T>>>,
    subscription: RefCell<Option<SubscriptionRef>>,
    connected: Cell<bool>,
    /// Bumped by every connect; signals from older executions are stale.
    generation: Cell<u64>,
}

impl<T: Clone + 'static> Connection<T> {
    fn describe(&self) -> String {
        self.upstream.name().unwrap_or("stream").to_string()
    }

    /// The hub subscribers attach to, created on first use and again after
    /// each shutdown.
    fn hub(&self) -> Hub<T> {
        self.hub.borrow_mut().get_or_insert_with(|| (self.factory)()).clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connected.get() && self.generation.get() == generation
    }

    fn shutdown(&self, cancel_upstream: bool) {
        self.connected.set(false);
        let subscription = self.subscription.borrow_mut().take();
        if cancel_upstream {
            if let Some(subscription) = subscription {
                subscription.cancel();
            }
        }
        self.hub.borrow_mut().take();
    }
}

/// Forwards the shared upstream execution into the current hub.
struct ConnectionSubscriber<T> {
    connection: Weak<Connection<T>>,
    hub: Hub<T>,
    generation: u64,
}

impl<T: Clone + 'static> ConnectionSubscriber<T> {
    /// Returns true when a later connect or a disconnect superseded this
    /// execution.
    fn is_stale(&self) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|connection| !connection.is_current(self.generation))
    }

    fn shutdown(&self) -> bool {
        match self.connection.upgrade() {
            Some(connection) if !connection.is_current(self.generation) => false,
            Some(connection) => {
                connection.shutdown(false);
                true
            }
            None => true,
        }
    }
}

impl<T: Clone + 'static> Subscriber<T> for ConnectionSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        match self.connection.upgrade() {
            Some(connection) if connection.is_current(self.generation) => {
                let mut slot = connection.subscription.borrow_mut();
                if slot.is_none() {
                    *slot = Some(subscription);
                }
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, item: T) {
        if !self.is_stale() {
            self.hub.next(item);
        }
    }

    fn on_error(&self, error: Error) {
        if self.shutdown() {
            self.hub.error(error);
        }
    }

    fn on_complete(&self) {
        if self.shutdown() {
            self.hub.complete();
        }
    }
}

/// A stream that multicasts one upstream execution through a [`Hub`].
///
/// Subscribers attach to the hub at any time; the upstream is subscribed
/// only by [`connect`](Self::connect) and released by
/// [`disconnect`](Self::disconnect) or by its own terminal signal. After
/// either, the next subscriber or connection gets a fresh hub.
pub struct ConnectableStream<T> {
    connection: Rc<Connection<T>>,
}

impl<T> Clone for ConnectableStream<T> {
    fn clone(&self) -> Self {
        Self {
            connection: Rc::clone(&self.connection),
        }
    }
}

impl<T> fmt::Debug for ConnectableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectableStream")
            .field("upstream", &self.connection.upstream)
            .field("connected", &self.connection.connected.get())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> ConnectableStream<T> {
    /// Multicasts `upstream` through hubs built by `factory`.
    pub fn new(upstream: Stream<T>, factory: impl Fn() -> Hub<T> + 'static) -> Self {
        Self {
            connection: Rc::new(Connection {
                upstream,
                factory: Box::new(factory),
                hub: RefCell::new(None),
                subscription: RefCell::new(None),
                connected: Cell::new(false),
                generation: Cell::new(0),
            }),
        }
    }

    /// A stream that subscribes to the current hub.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let stream = Stream::from_source(ConnectableSource {
            connection: Rc::clone(&self.connection),
        });
        match self.connection.upstream.name() {
            Some(name) => stream.named(&format!("{name}.connectable")),
            None => stream,
        }
    }

    /// Returns true between a connect and the matching shutdown.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.connected.get()
    }

    /// Number of subscribers attached to the current hub.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.connection.hub.borrow().as_ref().map_or(0, Hub::subscriber_count)
    }

    /// Subscribes the upstream and starts forwarding into the hub.
    pub fn connect(&self) -> Result<(), ProtocolViolation> {
        let connection = &self.connection;
        if connection.connected.get() {
            return Err(ProtocolViolation::AlreadyConnected {
                stream: connection.describe(),
            });
        }
        debug!(stream = %connection.describe(), "connecting");
        let generation = connection.generation.get() + 1;
        connection.generation.set(generation);
        connection.connected.set(true);
        let subscriber = ConnectionSubscriber {
            connection: Rc::downgrade(connection),
            hub: connection.hub(),
            generation,
        };
        // Held at once: an upstream that subscribes later must still be
        // cancellable by a disconnect that comes first.
        let subscription = connection.upstream.subscribe(subscriber);
        if connection.is_current(generation) {
            *connection.subscription.borrow_mut() = Some(subscription);
        }
        Ok(())
    }

    /// Cancels the upstream subscription and drops the hub.
    pub fn disconnect(&self) -> Result<(), ProtocolViolation> {
        let connection = &self.connection;
        if !connection.connected.get() {
            return Err(ProtocolViolation::NotConnected {
                stream: connection.describe(),
            });
        }
        debug!(stream = %connection.describe(), "disconnecting");
        connection.shutdown(true);
        Ok(())
    }

    /// A stream that connects when its first subscriber arrives and
    /// disconnects when the last one leaves.
    #[must_use]
    pub fn ref_count(&self) -> Stream<T> {
        Stream::stage(
            RefCountSource {
                connectable: self.clone(),
            },
            "ref_count",
            None,
        )
    }
}

struct ConnectableSource<T> {
    connection: Rc<Connection<T>>,
}

impl<T: Clone + 'static> Source<T> for ConnectableSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        self.connection.hub().subscribe_raw(subscriber)
    }
}

struct RefCountSource<T> {
    connectable: ConnectableStream<T>,
}

impl<T: Clone + 'static> Source<T> for RefCountSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| RefCountStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            connectable: self.connectable.clone(),
        });
        self.connectable.connection.hub().subscribe_raw(stage.clone());
        if !stage.link.is_done() && !self.connectable.is_connected() {
            report(self.connectable.connect());
        }
        stage
    }
}

fn report(result: Result<(), ProtocolViolation>) {
    if let Err(violation) = result {
        invariant::fail(&violation);
    }
}

/// One downstream of a ref-counted stream.
struct RefCountStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    connectable: ConnectableStream<T>,
}

impl<T: Clone + 'static> RefCountStage<T> {
    /// Disconnects once the last downstream has left.
    fn release(&self) {
        let connectable = &self.connectable;
        if connectable.is_connected() && connectable.subscriber_count() == 0 {
            report(connectable.disconnect());
        }
    }
}

impl<T: Clone + 'static> Subscriber<T> for RefCountStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        if let Some(this) = self.this.upgrade() {
            self.link.subscribe(this);
        }
    }

    fn on_next(&self, item: T) {
        self.link.next(item);
    }

    fn on_error(&self, error: Error) {
        self.link.error(error);
        self.release();
    }

    fn on_complete(&self) {
        self.link.complete();
        self.release();
    }
}

impl<T: Clone + 'static> Subscription for RefCountStage<T> {
    fn cancel(&self) {
        if self.link.is_done() {
            return;
        }
        self.link.cancel();
        self.release();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Multicasts through a hub that forwards only live items.
    #[must_use]
    pub fn publish(self) -> ConnectableStream<T> {
        ConnectableStream::new(self, Hub::publish)
    }

    /// Multicasts through a hub that starts each subscriber at the latest
    /// item, or at `initial` before the first one.
    #[must_use]
    pub fn publish_current_value(self, initial: T) -> ConnectableStream<T> {
        ConnectableStream::new(self, move || Hub::current_value(initial.clone()))
    }

    /// Multicasts through a hub that replays every item.
    #[must_use]
    pub fn publish_replay(self) -> ConnectableStream<T> {
        ConnectableStream::new(self, || Hub::replay(None, None))
    }

    /// Multicasts through a hub that replays the last `max_size` items.
    #[must_use]
    pub fn publish_replay_with_max_size(self, max_size: usize) -> ConnectableStream<T> {
        ConnectableStream::new(self, move || Hub::replay(Some(max_size), None))
    }

    /// Multicasts through a hub that replays items younger than `max_age`
    /// milliseconds.
    #[must_use]
    pub fn publish_replay_with_max_age(self, max_age: u64) -> ConnectableStream<T> {
        ConnectableStream::new(self, move || Hub::replay(None, Some(max_age)))
    }

    /// Shares one upstream execution among all current subscribers.
    #[must_use]
    pub fn share(self) -> Self {
        self.publish().ref_count()
    }
}
