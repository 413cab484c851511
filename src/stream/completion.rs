//! Operators that act when upstream completes: `last`, `default_if_empty`,
//! `error_if_empty` and the shortcuts built on them.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::util::RingBuffer;

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

enum CompletionKind<T> {
    Last(usize),
    DefaultIfEmpty(Rc<dyn Fn() -> T>),
    ErrorIfEmpty(Rc<dyn Fn() -> Error>),
}

impl<T> Clone for CompletionKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Last(count) => Self::Last(*count),
            Self::DefaultIfEmpty(default) => Self::DefaultIfEmpty(Rc::clone(default)),
            Self::ErrorIfEmpty(error) => Self::ErrorIfEmpty(Rc::clone(error)),
        }
    }
}

struct CompletionSource<T> {
    upstream: Stream<T>,
    kind: CompletionKind<T>,
}

impl<T: 'static> Source<T> for CompletionSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| CompletionStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            kind: self.kind.clone(),
            retained: RefCell::new(RingBuffer::default()),
            seen: Cell::new(false),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct CompletionStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    kind: CompletionKind<T>,
    retained: RefCell<RingBuffer<T>>,
    seen: Cell<bool>,
}

impl<T: 'static> Subscriber<T> for CompletionStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        if let Some(this) = self.this.upgrade() {
            self.link.subscribe(this);
        }
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        self.seen.set(true);
        if let CompletionKind::Last(count) = self.kind {
            let mut retained = self.retained.borrow_mut();
            retained.add(item);
            if retained.len() > count {
                retained.pop();
            }
        } else {
            self.link.next(item);
        }
    }

    fn on_error(&self, error: Error) {
        self.retained.borrow_mut().clear();
        self.link.error(error);
    }

    fn on_complete(&self) {
        if self.link.is_done() {
            return;
        }
        match &self.kind {
            CompletionKind::Last(_) => {
                let mut retained = self.retained.take();
                for item in retained.drain() {
                    if self.link.is_done() {
                        return;
                    }
                    self.link.next(item);
                }
                self.link.complete();
            }
            CompletionKind::DefaultIfEmpty(default) => {
                if !self.seen.get() {
                    self.link.next(default());
                }
                self.link.complete();
            }
            CompletionKind::ErrorIfEmpty(error) => {
                if self.seen.get() {
                    self.link.complete();
                } else {
                    self.link.error(error());
                }
            }
        }
    }
}

impl<T: 'static> Subscription for CompletionStage<T> {
    fn cancel(&self) {
        self.link.cancel();
        self.retained.borrow_mut().clear();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn completion_stage(self, prefix: &str, params: Option<String>, kind: CompletionKind<T>) -> Self {
        Self::stage(CompletionSource { upstream: self, kind }, prefix, params)
    }

    /// The last `count` items, emitted when upstream completes.
    #[must_use]
    pub fn last(self, count: usize) -> Self {
        self.completion_stage("last", Some(count.to_string()), CompletionKind::Last(count))
    }

    /// Alias of [`last`](Self::last).
    #[must_use]
    pub fn take_last(self, count: usize) -> Self {
        self.last(count)
    }

    /// The last item, emitted when upstream completes.
    #[must_use]
    pub fn last_one(self) -> Self {
        self.last(1)
    }

    /// The last item, or a `NoSuchElement` error if there is none.
    #[must_use]
    pub fn last_or_error(self) -> Self {
        self.last(1).error_if_empty(Error::no_such_element)
    }

    /// The last item, or `default` if there is none.
    #[must_use]
    pub fn last_or_default(self, default: T) -> Self
    where
        T: Clone,
    {
        self.last(1).default_if_empty(default)
    }

    /// Emits `default` before completing if upstream emitted nothing.
    #[must_use]
    pub fn default_if_empty(self, default: T) -> Self
    where
        T: Clone,
    {
        self.completion_stage(
            "default_if_empty",
            None,
            CompletionKind::DefaultIfEmpty(Rc::new(move || default.clone())),
        )
    }

    /// Fails with `error()` instead of completing if upstream emitted
    /// nothing.
    #[must_use]
    pub fn error_if_empty(self, error: impl Fn() -> Error + 'static) -> Self {
        self.completion_stage("error_if_empty", None, CompletionKind::ErrorIfEmpty(Rc::new(error)))
    }
}
