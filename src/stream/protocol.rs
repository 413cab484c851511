//! The push protocol: [`Subscriber`], [`Subscription`], [`Source`] and [`Stream`].
//!
//! A subscriber sees `on_subscribe` once and first, then any number of
//! `on_next`, then at most one of `on_error` / `on_complete`. A subscription
//! is done exactly once, by cancellation or by a terminal signal passing
//! through it, and cancellation only ever travels upstream.
//!
//! All callbacks take `&self`: a subscriber may cancel its own subscription
//! from inside `on_next`, and every stage tolerates that.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config;
use crate::error::Error;
use crate::tracing_compat::trace;

use super::validate::ValidatingSubscriber;

/// Cancelable handle for one subscribe-to-source binding.
pub trait Subscription {
    /// Cancels the binding and, transitively, everything upstream of it.
    /// A second call does nothing.
    fn cancel(&self);

    /// Returns true once cancelled or terminated.
    fn is_done(&self) -> bool;
}

/// Shared subscription handle.
pub type SubscriptionRef = Rc<dyn Subscription>;

/// Sink for the signals of one subscription.
pub trait Subscriber<T> {
    /// First signal; hands over the subscription.
    fn on_subscribe(&self, subscription: SubscriptionRef);

    /// An item.
    fn on_next(&self, item: T);

    /// Terminal failure.
    fn on_error(&self, error: Error);

    /// Terminal success.
    fn on_complete(&self);
}

/// Shared subscriber handle.
pub type SubscriberRef<T> = Rc<dyn Subscriber<T>>;

/// Imperative sink: hubs and the `create` emitter implement it.
pub trait EventEmitter<T> {
    /// Emits an item.
    fn next(&self, item: T);

    /// Emits a terminal error.
    fn error(&self, error: Error);

    /// Emits completion.
    fn complete(&self);

    /// Returns true once no further signals are accepted.
    fn is_done(&self) -> bool;
}

/// What a [`Stream`] does when subscribed.
///
/// Implementations call `subscriber.on_subscribe` before anything else and
/// return the subscription they handed over.
pub trait Source<T> {
    /// Starts one execution for `subscriber`.
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef;
}

/// An immutable, re-subscribable description of a push source.
///
/// Cloning is cheap; every [`subscribe`](Self::subscribe) starts an
/// independent execution.
pub struct Stream<T> {
    source: Rc<dyn Source<T>>,
    name: Option<Rc<str>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
            name: self.name.clone(),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("name", &self.name).finish()
    }
}

impl<T: 'static> Stream<T> {
    /// Wraps a source.
    pub fn from_source(source: impl Source<T> + 'static) -> Self {
        Self {
            source: Rc::new(source),
            name: None,
        }
    }

    /// Wraps a source with a generated diagnostic name.
    pub(crate) fn stage(
        source: impl Source<T> + 'static,
        prefix: &str,
        params: Option<String>,
    ) -> Self {
        Self {
            source: Rc::new(source),
            name: config::generate_name(None, prefix, params.as_deref()).map(Rc::from),
        }
    }

    /// Sets the diagnostic name. Ignored when names are disabled.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = config::generate_name(Some(name), "", None).map(Rc::from);
        self
    }

    /// The diagnostic name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Subscribes `subscriber`.
    pub fn subscribe(&self, subscriber: impl Subscriber<T> + 'static) -> SubscriptionRef {
        self.subscribe_rc(Rc::new(subscriber))
    }

    /// Subscribes a shared subscriber, wrapping it in the protocol validator
    /// when subscription validation is enabled.
    pub fn subscribe_rc(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        trace!(stream = ?self.name(), "subscribe");
        let subscriber: SubscriberRef<T> = if config::validate_subscriptions() {
            Rc::new(ValidatingSubscriber::new(subscriber, self.name.clone()))
        } else {
            subscriber
        };
        self.source.subscribe_raw(subscriber)
    }

    /// Forwards every signal to `emitter`.
    pub fn subscribe_emitter(&self, emitter: Rc<dyn EventEmitter<T>>) -> SubscriptionRef {
        self.subscribe(super::subscriber::EmitterSubscriber::new(emitter))
    }

    /// Runs `action` for every item. A terminal error is reported as
    /// uncaught.
    pub fn for_each(&self, action: impl FnMut(T) + 'static) -> SubscriptionRef {
        self.subscribe(super::subscriber::ForEachSubscriber::new(action))
    }

    /// Applies a stream transformation.
    pub fn compose<U>(self, f: impl FnOnce(Self) -> Stream<U>) -> Stream<U> {
        f(self)
    }
}

/// The downstream half shared by every operator stage.
///
/// Holds the downstream subscriber and the upstream subscription until the
/// stage is done, then drops both so a finished chain frees itself. No
/// `RefCell` borrow is held while a downstream callback runs.
pub(crate) struct Downstream<T> {
    subscriber: RefCell<Option<SubscriberRef<T>>>,
    upstream: RefCell<Option<SubscriptionRef>>,
    done: Cell<bool>,
}

impl<T> Downstream<T> {
    pub(crate) fn new(subscriber: SubscriberRef<T>) -> Self {
        Self {
            subscriber: RefCell::new(Some(subscriber)),
            upstream: RefCell::new(None),
            done: Cell::new(false),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.get()
    }

    /// Records the upstream subscription; cancels it at once if this stage
    /// was cancelled before it arrived.
    pub(crate) fn set_upstream(&self, upstream: SubscriptionRef) {
        if self.done.get() {
            upstream.cancel();
            return;
        }
        let previous = self.upstream.borrow_mut().replace(upstream);
        drop(previous);
    }

    /// Forgets the upstream subscription without cancelling it.
    pub(crate) fn clear_upstream(&self) {
        let previous = self.upstream.borrow_mut().take();
        drop(previous);
    }

    fn subscriber(&self) -> Option<SubscriberRef<T>> {
        self.subscriber.borrow().clone()
    }

    /// Hands `this` to the downstream subscriber.
    pub(crate) fn subscribe(&self, this: SubscriptionRef) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_subscribe(this);
        }
    }

    pub(crate) fn next(&self, item: T) {
        if self.done.get() {
            return;
        }
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_next(item);
        }
    }

    fn finish(&self) -> (Option<SubscriberRef<T>>, Option<SubscriptionRef>) {
        self.done.set(true);
        let subscriber = self.subscriber.borrow_mut().take();
        let upstream = self.upstream.borrow_mut().take();
        (subscriber, upstream)
    }

    pub(crate) fn error(&self, error: Error) {
        if self.done.get() {
            return;
        }
        let (subscriber, _upstream) = self.finish();
        if let Some(subscriber) = subscriber {
            subscriber.on_error(error);
        }
    }

    pub(crate) fn complete(&self) {
        if self.done.get() {
            return;
        }
        let (subscriber, _upstream) = self.finish();
        if let Some(subscriber) = subscriber {
            subscriber.on_complete();
        }
    }

    /// Cancels upstream, then completes downstream.
    pub(crate) fn cancel_upstream_then_complete(&self) {
        if self.done.get() {
            return;
        }
        let (subscriber, upstream) = self.finish();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        if let Some(subscriber) = subscriber {
            subscriber.on_complete();
        }
    }

    /// Cancels upstream, then errors downstream.
    pub(crate) fn cancel_upstream_then_error(&self, error: Error) {
        if self.done.get() {
            return;
        }
        let (subscriber, upstream) = self.finish();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        if let Some(subscriber) = subscriber {
            subscriber.on_error(error);
        }
    }

    /// Downstream cancellation: drop the subscriber and cancel upstream.
    pub(crate) fn cancel(&self) {
        if self.done.get() {
            return;
        }
        let (subscriber, upstream) = self.finish();
        drop(subscriber);
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}
