//! Flattening a stream of streams: `merge_all`, `concat_all`, `switch_all`,
//! `exhaust_all` and everything built on them.
//!
//! One `FlattenStage` serves all modes. Inner subscribers live in a
//! `Slab` owned by the stage and reach back only through the
//! `InnerContainer` trait, addressed by their slab key. Inner streams are
//! subscribed from a drain loop, so a long run of synchronously completing
//! inner streams does not grow the stack.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use slab::Slab;
use smallvec::SmallVec;

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::util::RingBuffer;

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};
use super::source;

/// Concurrency used by `merge_all` callers that do not pick one.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1024 * 1024;

const PENDING_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Merge { max: usize },
    Switch,
    Exhaust,
}

/// The callbacks an inner subscriber makes into the stage that owns it.
trait InnerContainer<T> {
    fn inner_next(&self, item: T);
    fn inner_error(&self, key: usize, error: Error);
    fn inner_complete(&self, key: usize);
}

struct InnerSubscriber<T> {
    key: usize,
    container: Weak<dyn InnerContainer<T>>,
    upstream: RefCell<Option<SubscriptionRef>>,
    done: Cell<bool>,
}

impl<T: 'static> InnerSubscriber<T> {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        let upstream = self.upstream.borrow_mut().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    fn finish(&self) -> Option<Rc<dyn InnerContainer<T>>> {
        if self.done.replace(true) {
            return None;
        }
        self.upstream.borrow_mut().take();
        self.container.upgrade()
    }
}

impl<T: 'static> Subscriber<T> for InnerSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        if self.done.get() {
            subscription.cancel();
            return;
        }
        *self.upstream.borrow_mut() = Some(subscription);
    }

    fn on_next(&self, item: T) {
        if self.done.get() {
            return;
        }
        if let Some(container) = self.container.upgrade() {
            container.inner_next(item);
        }
    }

    fn on_error(&self, error: Error) {
        if let Some(container) = self.finish() {
            container.inner_error(self.key, error);
        }
    }

    fn on_complete(&self) {
        if let Some(container) = self.finish() {
            container.inner_complete(self.key);
        }
    }
}

struct FlattenState<T> {
    active: Slab<Rc<InnerSubscriber<T>>>,
    pending: Option<RingBuffer<Stream<T>>>,
    starting: RingBuffer<(Rc<InnerSubscriber<T>>, Stream<T>)>,
    upstream_completed: bool,
}

impl<T> FlattenState<T> {
    fn pending_is_empty(&self) -> bool {
        self.pending.as_ref().is_none_or(RingBuffer::is_empty)
    }

    fn is_exhausted(&self) -> bool {
        self.upstream_completed && self.active.is_empty() && self.pending_is_empty()
    }

    fn take_active(&mut self) -> SmallVec<[Rc<InnerSubscriber<T>>; 4]> {
        self.pending = None;
        self.starting.clear();
        self.active.drain().collect()
    }
}

struct FlattenSource<T> {
    upstream: Stream<Stream<T>>,
    mode: Mode,
}

impl<T: 'static> Source<T> for FlattenSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| FlattenStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            mode: self.mode,
            state: RefCell::new(FlattenState {
                active: Slab::new(),
                pending: None,
                starting: RingBuffer::default(),
                upstream_completed: false,
            }),
            launching: Cell::new(false),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct FlattenStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    mode: Mode,
    state: RefCell<FlattenState<T>>,
    launching: Cell<bool>,
}

impl<T: 'static> FlattenStage<T> {
    /// Reserves an active slot for `stream` and queues it for subscription.
    fn admit(&self, state: &mut FlattenState<T>, stream: Stream<T>) {
        let container: Weak<dyn InnerContainer<T>> = self.this.clone();
        let entry = state.active.vacant_entry();
        let inner = Rc::new(InnerSubscriber {
            key: entry.key(),
            container,
            upstream: RefCell::new(None),
            done: Cell::new(false),
        });
        entry.insert(Rc::clone(&inner));
        state.starting.add((inner, stream));
    }

    fn launch(&self) {
        if self.launching.replace(true) {
            return;
        }
        loop {
            if self.link.is_done() {
                self.state.borrow_mut().starting.clear();
                break;
            }
            let next = self.state.borrow_mut().starting.pop();
            let Some((inner, stream)) = next else {
                break;
            };
            stream.subscribe_rc(inner);
        }
        self.launching.set(false);
    }

    fn cancel_inners(&self) {
        let inners = self.state.borrow_mut().take_active();
        for inner in inners {
            inner.cancel();
        }
    }

    fn complete_if_exhausted(&self) {
        let exhausted = self.state.borrow().is_exhausted();
        if exhausted {
            self.link.complete();
        }
    }
}

impl<T: 'static> InnerContainer<T> for FlattenStage<T> {
    fn inner_next(&self, item: T) {
        self.link.next(item);
    }

    fn inner_error(&self, key: usize, error: Error) {
        if self.link.is_done() {
            return;
        }
        self.state.borrow_mut().active.try_remove(key);
        self.cancel_inners();
        self.link.cancel_upstream_then_error(error);
    }

    fn inner_complete(&self, key: usize) {
        if self.link.is_done() {
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            state.active.try_remove(key);
            if let Mode::Merge { max } = self.mode {
                if state.active.len() < max {
                    let next = state.pending.as_mut().and_then(RingBuffer::pop);
                    if let Some(next) = next {
                        self.admit(&mut state, next);
                    }
                }
            }
        }
        self.launch();
        self.complete_if_exhausted();
    }
}

impl<T: 'static> Subscriber<Stream<T>> for FlattenStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        if let Some(this) = self.this.upgrade() {
            self.link.subscribe(this);
        }
    }

    fn on_next(&self, stream: Stream<T>) {
        if self.link.is_done() {
            return;
        }
        let replaced = {
            let mut state = self.state.borrow_mut();
            match self.mode {
                Mode::Merge { max } => {
                    if state.active.len() < max {
                        self.admit(&mut state, stream);
                    } else {
                        state
                            .pending
                            .get_or_insert_with(|| RingBuffer::new(PENDING_CAPACITY))
                            .add(stream);
                    }
                    SmallVec::new()
                }
                Mode::Switch => {
                    let replaced = state.take_active();
                    self.admit(&mut state, stream);
                    replaced
                }
                Mode::Exhaust => {
                    if state.active.is_empty() {
                        self.admit(&mut state, stream);
                    }
                    SmallVec::new()
                }
            }
        };
        for inner in replaced {
            inner.cancel();
        }
        self.launch();
    }

    fn on_error(&self, error: Error) {
        self.cancel_inners();
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.state.borrow_mut().upstream_completed = true;
        self.complete_if_exhausted();
    }
}

impl<T: 'static> Subscription for FlattenStage<T> {
    fn cancel(&self) {
        self.link.cancel();
        self.cancel_inners();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<Stream<T>> {
    fn flatten(self, mode: Mode, prefix: &str, params: Option<String>) -> Stream<T> {
        Stream::stage(
            FlattenSource {
                upstream: self,
                mode,
            },
            prefix,
            params,
        )
    }

    /// Subscribes to inner streams as they arrive, at most
    /// `max_concurrency` at a time; the rest wait in arrival order.
    ///
    /// Completes once the outer stream and every inner stream have
    /// completed. The first inner error cancels everything and is
    /// forwarded.
    #[must_use]
    pub fn merge_all(self, max_concurrency: usize) -> Stream<T> {
        invariant::check_api(max_concurrency > 0, || ProtocolViolation::InvalidArgument {
            operator: "merge_all",
            detail: "max_concurrency must be greater than 0".to_string(),
        });
        let max = max_concurrency.max(1);
        self.flatten(Mode::Merge { max }, "merge", Some(max.to_string()))
    }

    /// Subscribes to inner streams one after another.
    #[must_use]
    pub fn concat_all(self) -> Stream<T> {
        self.flatten(Mode::Merge { max: 1 }, "concat", None)
    }

    /// Follows the most recent inner stream, cancelling the previous one.
    #[must_use]
    pub fn switch_all(self) -> Stream<T> {
        self.flatten(Mode::Switch, "switch", None)
    }

    /// Follows one inner stream at a time; inner streams arriving while
    /// one is active are dropped.
    #[must_use]
    pub fn exhaust_all(self) -> Stream<T> {
        self.flatten(Mode::Exhaust, "exhaust", None)
    }
}

impl<T: 'static> Stream<T> {
    /// Maps each item to a stream and merges them, at most
    /// `max_concurrency` at a time.
    #[must_use]
    pub fn merge_map<U: 'static>(self, f: impl Fn(T) -> Stream<U> + 'static, max_concurrency: usize) -> Stream<U> {
        self.map(f).merge_all(max_concurrency)
    }

    /// Maps each item to a stream and concatenates them.
    #[must_use]
    pub fn concat_map<U: 'static>(self, f: impl Fn(T) -> Stream<U> + 'static) -> Stream<U> {
        self.map(f).concat_all()
    }

    /// Maps each item to a stream, following only the latest.
    #[must_use]
    pub fn switch_map<U: 'static>(self, f: impl Fn(T) -> Stream<U> + 'static) -> Stream<U> {
        self.map(f).switch_all()
    }

    /// Maps each item to a stream, ignoring items while one is active.
    #[must_use]
    pub fn exhaust_map<U: 'static>(self, f: impl Fn(T) -> Stream<U> + 'static) -> Stream<U> {
        self.map(f).exhaust_all()
    }

    /// Interleaves this stream with `other`.
    #[must_use]
    pub fn merge_with(self, other: Self) -> Self {
        merge([self, other])
    }

    /// Emits this stream, then `other`.
    #[must_use]
    pub fn append(self, other: Self) -> Self {
        concat([self, other])
    }

    /// Emits `other`, then this stream.
    #[must_use]
    pub fn prepend(self, other: Self) -> Self {
        concat([other, self])
    }

    /// Emits `values` before the items of this stream.
    #[must_use]
    pub fn start_with(self, values: impl IntoIterator<Item = T>) -> Self
    where
        T: Clone,
    {
        self.prepend(source::of(values))
    }

    /// Emits `values` after this stream completes.
    #[must_use]
    pub fn end_with(self, values: impl IntoIterator<Item = T>) -> Self
    where
        T: Clone,
    {
        self.append(source::of(values))
    }
}

/// Emits every stream of `streams` in turn.
pub fn concat<T: 'static>(streams: impl IntoIterator<Item = Stream<T>>) -> Stream<T> {
    source::of(streams).concat_all()
}

/// Subscribes to every stream of `streams` at once and interleaves them.
pub fn merge<T: 'static>(streams: impl IntoIterator<Item = Stream<T>>) -> Stream<T> {
    source::of(streams).merge_all(DEFAULT_MAX_CONCURRENCY)
}
