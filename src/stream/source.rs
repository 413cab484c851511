//! Source streams: the ways a chain starts.
//!
//! Every source checks its subscription's `done` flag before each emission,
//! so a subscriber that cancels from inside `on_next` stops the source at
//! once.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::invariant::{self, ProtocolViolation};
use crate::time::{self, Cancelable};

use super::protocol::{EventEmitter, Source, Stream, SubscriberRef, Subscription, SubscriptionRef};
use super::subscriber::CancelHook;

/// Subscription of a synchronous source.
#[derive(Default)]
struct SourceSubscription {
    done: Cell<bool>,
}

impl Subscription for SourceSubscription {
    fn cancel(&self) {
        self.done.set(true);
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

struct StaticSource<T> {
    items: Rc<[T]>,
}

impl<T: Clone + 'static> Source<T> for StaticSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let subscription = Rc::new(SourceSubscription::default());
        subscriber.on_subscribe(subscription.clone());
        for item in self.items.iter() {
            if subscription.is_done() {
                return subscription;
            }
            subscriber.on_next(item.clone());
        }
        if !subscription.is_done() {
            subscriber.on_complete();
            subscription.done.set(true);
        }
        subscription
    }
}

/// Emits every value of `items`, then completes.
pub fn of<T: Clone + 'static>(items: impl IntoIterator<Item = T>) -> Stream<T> {
    let items: Rc<[T]> = items.into_iter().collect();
    let count = items.len();
    Stream::stage(StaticSource { items }, "of", Some(count.to_string()))
}

type Producer<T> = Rc<dyn Fn() -> Result<Option<T>>>;

/// Emits at most one value produced at subscribe time.
struct CallableSource<T> {
    producer: Producer<T>,
}

impl<T: 'static> Source<T> for CallableSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let subscription = Rc::new(SourceSubscription::default());
        subscriber.on_subscribe(subscription.clone());
        if subscription.is_done() {
            return subscription;
        }
        match (self.producer)() {
            Ok(Some(item)) => {
                subscriber.on_next(item);
                if !subscription.is_done() {
                    subscriber.on_complete();
                }
            }
            Ok(None) => subscriber.on_complete(),
            Err(err) => {
                if !subscription.is_done() {
                    subscriber.on_error(err);
                }
            }
        }
        subscription.done.set(true);
        subscription
    }
}

fn callable<T: 'static>(prefix: &str, producer: impl Fn() -> Result<Option<T>> + 'static) -> Stream<T> {
    Stream::stage(
        CallableSource {
            producer: Rc::new(producer),
        },
        prefix,
        None,
    )
}

/// Emits `value` if present, then completes.
pub fn of_option<T: Clone + 'static>(value: Option<T>) -> Stream<T> {
    callable("of_option", move || Ok(value.clone()))
}

/// Completes immediately.
#[must_use]
pub fn empty<T: 'static>() -> Stream<T> {
    callable("empty", || Ok(None))
}

/// Fails immediately with `error`.
#[must_use]
pub fn fail<T: 'static>(error: Error) -> Stream<T> {
    callable("fail", move || Err(error.clone()))
}

/// Emits the value `supplier` returns, then completes.
pub fn from_fn<T: 'static>(supplier: impl Fn() -> T + 'static) -> Stream<T> {
    callable("from_fn", move || Ok(Some(supplier())))
}

/// Emits the value `callable` returns, or fails with its error.
pub fn from_result<T: 'static>(callable_fn: impl Fn() -> Result<T> + 'static) -> Stream<T> {
    callable("from_result", move || callable_fn().map(Some))
}

/// Runs `action` on subscribe, then completes without items.
pub fn from_action<T: 'static>(action: impl Fn() -> Result<()> + 'static) -> Stream<T> {
    callable("from_action", move || action().map(|()| None))
}

struct NeverSource;

impl<T: 'static> Source<T> for NeverSource {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let subscription: SubscriptionRef = Rc::new(SourceSubscription::default());
        subscriber.on_subscribe(Rc::clone(&subscription));
        subscription
    }
}

/// Never emits and never terminates.
#[must_use]
pub fn never<T: 'static>() -> Stream<T> {
    Stream::stage(NeverSource, "never", None)
}

struct RangeSource {
    start: i64,
    count: usize,
}

impl Source<i64> for RangeSource {
    fn subscribe_raw(&self, subscriber: SubscriberRef<i64>) -> SubscriptionRef {
        let subscription = Rc::new(SourceSubscription::default());
        subscriber.on_subscribe(subscription.clone());
        let mut value = self.start;
        for _ in 0..self.count {
            if subscription.is_done() {
                return subscription;
            }
            subscriber.on_next(value);
            value = value.wrapping_add(1);
        }
        if !subscription.is_done() {
            subscriber.on_complete();
            subscription.done.set(true);
        }
        subscription
    }
}

/// Emits `count` consecutive integers starting at `start`.
#[must_use]
pub fn range(start: i64, count: usize) -> Stream<i64> {
    Stream::stage(
        RangeSource { start, count },
        "range",
        Some(format!("{start}, {count}")),
    )
}

struct PeriodicSource {
    period: u64,
}

struct PeriodicSubscription {
    done: Cell<bool>,
    task: RefCell<Option<Cancelable>>,
}

impl Subscription for PeriodicSubscription {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

impl Source<u64> for PeriodicSource {
    fn subscribe_raw(&self, subscriber: SubscriberRef<u64>) -> SubscriptionRef {
        let subscription = Rc::new(PeriodicSubscription {
            done: Cell::new(false),
            task: RefCell::new(None),
        });
        subscriber.on_subscribe(subscription.clone());
        if subscription.is_done() {
            return subscription;
        }
        let tick = Rc::downgrade(&subscription);
        let mut counter = 0_u64;
        let task = time::schedule_at_fixed_rate(
            move || {
                if tick.upgrade().is_some_and(|s| !s.is_done()) {
                    subscriber.on_next(counter);
                    counter += 1;
                }
            },
            self.period,
        );
        if subscription.is_done() {
            task.cancel();
        } else {
            *subscription.task.borrow_mut() = Some(task);
        }
        subscription
    }
}

/// Emits 0, 1, 2, ... once per `period` milliseconds, the first after one
/// period. Never completes.
#[must_use]
pub fn periodic(period: u64) -> Stream<u64> {
    invariant::check_api(period > 0, || ProtocolViolation::ZeroPeriod { period });
    Stream::stage(PeriodicSource { period }, "periodic", Some(period.to_string()))
}

/// Emits a value from `supplier` once per `period` milliseconds.
pub fn generate<T: 'static>(supplier: impl Fn() -> T + 'static, period: u64) -> Stream<T> {
    periodic(period).map(move |_| supplier())
}

/// Emitter handed to a [`create`] callback.
///
/// Signals after a terminal one, or after cancellation, are ignored.
pub struct Emitter<T> {
    subscriber: RefCell<Option<SubscriberRef<T>>>,
    done: Cell<bool>,
    cancelled: Cell<bool>,
    cancel_hook: RefCell<Option<CancelHook>>,
}

impl<T> Emitter<T> {
    fn new(subscriber: SubscriberRef<T>) -> Self {
        Self {
            subscriber: RefCell::new(Some(subscriber)),
            done: Cell::new(false),
            cancelled: Cell::new(false),
            cancel_hook: RefCell::new(None),
        }
    }

    /// Registers `hook` to run when the subscriber cancels. Runs it at once
    /// if that already happened.
    pub fn on_cancel(&self, hook: impl FnOnce() + 'static) {
        if self.cancelled.get() {
            hook();
            return;
        }
        let previous = self.cancel_hook.borrow_mut().replace(CancelHook::new(hook));
        drop(previous);
    }

    fn finish(&self) -> Option<SubscriberRef<T>> {
        self.done.set(true);
        let hook = self.cancel_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook.finish();
        }
        self.subscriber.borrow_mut().take()
    }
}

impl<T> EventEmitter<T> for Emitter<T> {
    fn next(&self, item: T) {
        if self.done.get() {
            return;
        }
        let subscriber = self.subscriber.borrow().clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_next(item);
        }
    }

    fn error(&self, error: Error) {
        if self.done.get() {
            return;
        }
        if let Some(subscriber) = self.finish() {
            subscriber.on_error(error);
        }
    }

    fn complete(&self) {
        if self.done.get() {
            return;
        }
        if let Some(subscriber) = self.finish() {
            subscriber.on_complete();
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

impl<T> Subscription for Emitter<T> {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        self.cancelled.set(true);
        let subscriber = self.subscriber.borrow_mut().take();
        drop(subscriber);
        let hook = self.cancel_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook.cancel();
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

type Creator<T> = Rc<dyn Fn(&Rc<Emitter<T>>) -> Result<()>>;

struct CreateSource<T> {
    creator: Creator<T>,
}

impl<T: 'static> Source<T> for CreateSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let emitter = Rc::new(Emitter::new(Rc::clone(&subscriber)));
        subscriber.on_subscribe(emitter.clone());
        if !emitter.done.get() {
            if let Err(err) = (self.creator)(&emitter) {
                emitter.error(err);
            }
        }
        emitter
    }
}

/// Runs `creator` with a fresh [`Emitter`] for every subscription.
///
/// An `Err` from `creator` is emitted as the terminal error unless the
/// emitter already finished.
pub fn create<T: 'static>(creator: impl Fn(&Rc<Emitter<T>>) -> Result<()> + 'static) -> Stream<T> {
    Stream::stage(
        CreateSource {
            creator: Rc::new(creator),
        },
        "create",
        None,
    )
}
