//! A self-connecting multicast over one upstream.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use slab::Slab;
use smallvec::SmallVec;

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::stream::{Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};
use crate::tracing_compat::debug;

use super::same;

#[derive(Clone)]
enum Terminal {
    Error(Error),
    Complete,
}

struct MulticastInner<T> {
    this: Weak<Self>,
    upstream: Stream<T>,
    subscribers: RefCell<Slab<SubscriberRef<T>>>,
    connection: RefCell<Option<SubscriptionRef>>,
    /// Bumped by every connect and disconnect.
    generation: Cell<u64>,
    terminal: RefCell<Option<Terminal>>,
}

struct MemberSubscription<T> {
    subject: Weak<MulticastInner<T>>,
    key: Cell<Option<usize>>,
    done: Cell<bool>,
}

impl<T: Clone + 'static> Subscription for MemberSubscription<T> {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        if let (Some(subject), Some(key)) = (self.subject.upgrade(), self.key.take()) {
            subject.remove(key);
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

/// Receives the shared upstream execution.
struct UpstreamSubscriber<T> {
    subject: Weak<MulticastInner<T>>,
    generation: u64,
}

impl<T: Clone + 'static> UpstreamSubscriber<T> {
    fn current(&self) -> Option<Rc<MulticastInner<T>>> {
        self.subject
            .upgrade()
            .filter(|subject| subject.is_current(self.generation))
    }
}

impl<T: Clone + 'static> Subscriber<T> for UpstreamSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        match self.current() {
            Some(subject) => {
                let mut connection = subject.connection.borrow_mut();
                if connection.is_none() {
                    *connection = Some(subscription);
                }
            }
            None => subscription.cancel(),
        }
    }

    fn on_next(&self, item: T) {
        if let Some(subject) = self.current() {
            subject.next(item);
        }
    }

    fn on_error(&self, error: Error) {
        if let Some(subject) = self.current() {
            subject.terminate(Terminal::Error(error));
        }
    }

    fn on_complete(&self) {
        if let Some(subject) = self.current() {
            subject.terminate(Terminal::Complete);
        }
    }
}

impl<T: Clone + 'static> MulticastInner<T> {
    fn describe(&self) -> String {
        self.upstream.name().unwrap_or("multicast").to_string()
    }

    /// Returns true while the execution started under `generation` is the
    /// live one.
    fn is_current(&self, generation: u64) -> bool {
        self.generation.get() == generation
            && self.terminal.borrow().is_none()
            && !self.subscribers.borrow().is_empty()
    }

    fn connect(&self) {
        debug!(subject = %self.describe(), "multicast connecting");
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let upstream = self.upstream.subscribe(UpstreamSubscriber {
            subject: self.this.clone(),
            generation,
        });
        if self.is_current(generation) {
            *self.connection.borrow_mut() = Some(upstream);
        } else {
            upstream.cancel();
        }
    }

    fn subscribe(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let subscription = Rc::new(MemberSubscription {
            subject: self.this.clone(),
            key: Cell::new(None),
            done: Cell::new(false),
        });
        let terminal = self.terminal.borrow().clone();
        if let Some(terminal) = terminal {
            subscription.done.set(true);
            subscriber.on_subscribe(subscription.clone());
            match terminal {
                Terminal::Error(error) => subscriber.on_error(error),
                Terminal::Complete => subscriber.on_complete(),
            }
            return subscription;
        }
        let duplicate = self.subscribers.borrow().iter().any(|(_, s)| same(s, &subscriber));
        if duplicate {
            invariant::check_api(false, || ProtocolViolation::DuplicateSubscriber {
                hub: self.describe(),
            });
        }
        let first = self.subscribers.borrow().is_empty();
        let key = self.subscribers.borrow_mut().insert(Rc::clone(&subscriber));
        subscription.key.set(Some(key));
        subscriber.on_subscribe(subscription.clone());
        if first && !subscription.is_done() && self.connection.borrow().is_none() {
            self.connect();
        }
        subscription
    }

    fn remove(&self, key: usize) {
        let removed = self.subscribers.borrow_mut().try_remove(key);
        drop(removed);
        if self.subscribers.borrow().is_empty() {
            self.generation.set(self.generation.get() + 1);
            let connection = self.connection.borrow_mut().take();
            if let Some(connection) = connection {
                debug!(subject = %self.describe(), "multicast disconnecting");
                connection.cancel();
            }
        }
    }

    fn next(&self, item: T) {
        let targets: SmallVec<[(usize, SubscriberRef<T>); 8]> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(key, subscriber)| (key, Rc::clone(subscriber)))
            .collect();
        for (key, subscriber) in targets {
            let live = self.subscribers.borrow().get(key).is_some_and(|s| same(s, &subscriber));
            if live {
                subscriber.on_next(item.clone());
            }
        }
    }

    fn terminate(&self, terminal: Terminal) {
        *self.terminal.borrow_mut() = Some(terminal.clone());
        self.connection.borrow_mut().take();
        let subscribers: Vec<SubscriberRef<T>> = self.subscribers.borrow_mut().drain().collect();
        for subscriber in subscribers {
            match &terminal {
                Terminal::Error(error) => subscriber.on_error(error.clone()),
                Terminal::Complete => subscriber.on_complete(),
            }
        }
    }
}

/// Shares one upstream execution among its subscribers, subscribing the
/// upstream when the first subscriber arrives and cancelling it when the
/// last one leaves.
///
/// Unlike `share`, subscribing the same subscriber twice through
/// [`subscribe`](Self::subscribe) is an API violation, and once the
/// upstream terminates every later subscriber receives that terminal signal.
pub struct MulticastSubject<T> {
    inner: Rc<MulticastInner<T>>,
}

impl<T> Clone for MulticastSubject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MulticastSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastSubject")
            .field("upstream", &self.inner.upstream)
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> MulticastSubject<T> {
    /// Multicasts `upstream`.
    #[must_use]
    pub fn new(upstream: Stream<T>) -> Self {
        let inner = Rc::new_cyclic(|this| MulticastInner {
            this: this.clone(),
            upstream,
            subscribers: RefCell::new(Slab::new()),
            connection: RefCell::new(None),
            generation: Cell::new(0),
            terminal: RefCell::new(None),
        });
        Self { inner }
    }

    /// Adds `subscriber` directly, without the protocol validator.
    pub fn subscribe(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        self.inner.subscribe(subscriber)
    }

    /// A stream whose subscribers join this subject.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        Stream::from_source(MulticastSource {
            inner: Rc::clone(&self.inner),
        })
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Returns true while the upstream subscription is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.borrow().is_some()
    }

    /// Returns true once the upstream terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.terminal.borrow().is_some()
    }
}

struct MulticastSource<T> {
    inner: Rc<MulticastInner<T>>,
}

impl<T: Clone + 'static> Source<T> for MulticastSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        self.inner.subscribe(subscriber)
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Wraps this stream in a [`MulticastSubject`].
    #[must_use]
    pub fn multicast(self) -> MulticastSubject<T> {
        MulticastSubject::new(self)
    }
}
