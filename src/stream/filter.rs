//! Filtering operators.
//!
//! All of them share one stage: a per-subscription test decides, for each
//! item, whether to forward it, drop it, or end the stream. Ending the stream
//! cancels upstream before completing downstream.

use std::cell::RefCell;
use std::collections::HashSet;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

/// What a filter test decided for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Emit,
    Drop,
    EmitThenComplete,
    Complete,
}

type Test<T> = Box<dyn FnMut(&T) -> Verdict>;
type TestFactory<T> = Rc<dyn Fn() -> Test<T>>;

struct FilterSource<T> {
    upstream: Stream<T>,
    factory: TestFactory<T>,
}

impl<T: 'static> Source<T> for FilterSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| FilterStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            test: RefCell::new((self.factory)()),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct FilterStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    test: RefCell<Test<T>>,
}

impl<T: 'static> Subscriber<T> for FilterStage<T> {
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
        let verdict = {
            let mut test = self.test.borrow_mut();
            (*test)(&item)
        };
        match verdict {
            Verdict::Emit => self.link.next(item),
            Verdict::Drop => {}
            Verdict::EmitThenComplete => {
                self.link.next(item);
                self.link.cancel_upstream_then_complete();
            }
            Verdict::Complete => self.link.cancel_upstream_then_complete(),
        }
    }

    fn on_error(&self, error: Error) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

impl<T: 'static> Subscription for FilterStage<T> {
    fn cancel(&self) {
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn filter_stage(
        self,
        prefix: &str,
        params: Option<String>,
        factory: impl Fn() -> Test<T> + 'static,
    ) -> Self {
        Self::stage(
            FilterSource {
                upstream: self,
                factory: Rc::new(factory),
            },
            prefix,
            params,
        )
    }

    /// Forwards the items `predicate` accepts.
    #[must_use]
    pub fn filter(self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        let predicate = Rc::new(predicate);
        self.filter_stage("filter", None, move || {
            let predicate = Rc::clone(&predicate);
            Box::new(move |item: &T| {
                if predicate(item) {
                    Verdict::Emit
                } else {
                    Verdict::Drop
                }
            })
        })
    }

    /// Drops every item; forwards only the terminal signal.
    #[must_use]
    pub fn ignore_elements(self) -> Self {
        self.filter_stage("ignore_elements", None, || Box::new(|_: &T| Verdict::Drop))
    }

    /// Forwards the first `count` items, then cancels upstream and completes.
    ///
    /// `count` must be positive.
    #[must_use]
    pub fn limit(self, count: usize) -> Self {
        invariant::check_api(count > 0, || ProtocolViolation::InvalidArgument {
            operator: "limit",
            detail: "count must be greater than 0".to_string(),
        });
        self.filter_stage("limit", Some(count.to_string()), move || {
            let mut seen = 0_usize;
            Box::new(move |_: &T| {
                seen += 1;
                if seen >= count {
                    Verdict::EmitThenComplete
                } else {
                    Verdict::Emit
                }
            })
        })
    }

    /// Alias of [`limit`](Self::limit).
    #[must_use]
    pub fn take(self, count: usize) -> Self {
        self.limit(count)
    }

    /// The first item, then completion.
    #[must_use]
    pub fn first(self) -> Self {
        self.limit(1)
    }

    /// The first item, or a `NoSuchElement` error if there is none.
    #[must_use]
    pub fn first_or_error(self) -> Self {
        self.limit(1).error_if_empty(Error::no_such_element)
    }

    /// The first item, or `default` if there is none.
    #[must_use]
    pub fn first_or_default(self, default: T) -> Self
    where
        T: Clone,
    {
        self.limit(1).default_if_empty(default)
    }

    /// Drops the first `count` items.
    #[must_use]
    pub fn skip(self, count: usize) -> Self {
        self.filter_stage("skip", Some(count.to_string()), move || {
            let mut remaining = count;
            Box::new(move |_: &T| {
                if remaining > 0 {
                    remaining -= 1;
                    Verdict::Drop
                } else {
                    Verdict::Emit
                }
            })
        })
    }

    /// Drops items while `predicate` holds, then forwards everything.
    #[must_use]
    pub fn skip_while(self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        let predicate = Rc::new(predicate);
        self.filter_stage("skip_while", None, move || {
            let predicate = Rc::clone(&predicate);
            let mut skipping = true;
            Box::new(move |item: &T| {
                if skipping && predicate(item) {
                    return Verdict::Drop;
                }
                skipping = false;
                Verdict::Emit
            })
        })
    }

    /// Drops items until `predicate` first holds, then forwards everything.
    #[must_use]
    pub fn skip_until(self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        self.skip_while(move |item| !predicate(item))
    }

    /// Forwards items while `predicate` holds; the first item failing it is
    /// dropped and the stream completes.
    #[must_use]
    pub fn take_while(self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        let predicate = Rc::new(predicate);
        self.filter_stage("take_while", None, move || {
            let predicate = Rc::clone(&predicate);
            Box::new(move |item: &T| {
                if predicate(item) {
                    Verdict::Emit
                } else {
                    Verdict::Complete
                }
            })
        })
    }

    /// Forwards items until `predicate` first holds.
    #[must_use]
    pub fn take_until(self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        self.take_while(move |item| !predicate(item))
    }

    /// Drops items already seen on this subscription.
    #[must_use]
    pub fn distinct(self) -> Self
    where
        T: Eq + Hash + Clone,
    {
        self.filter_stage("distinct", None, || {
            let mut seen = HashSet::new();
            Box::new(move |item: &T| {
                if seen.insert(item.clone()) {
                    Verdict::Emit
                } else {
                    Verdict::Drop
                }
            })
        })
    }

    /// Drops items equal to the one forwarded just before.
    #[must_use]
    pub fn skip_repeats(self) -> Self
    where
        T: PartialEq + Clone,
    {
        self.filter_successive_named("skip_repeats", |previous: Option<&T>, item: &T| {
            previous != Some(item)
        })
    }

    /// Forwards an item when `accept(previous, item)` holds, where
    /// `previous` is the last forwarded item.
    #[must_use]
    pub fn filter_successive(self, accept: impl Fn(Option<&T>, &T) -> bool + 'static) -> Self
    where
        T: Clone,
    {
        self.filter_successive_named("filter_successive", accept)
    }

    fn filter_successive_named(
        self,
        prefix: &str,
        accept: impl Fn(Option<&T>, &T) -> bool + 'static,
    ) -> Self
    where
        T: Clone,
    {
        let accept = Rc::new(accept);
        self.filter_stage(prefix, None, move || {
            let accept = Rc::clone(&accept);
            let mut previous: Option<T> = None;
            Box::new(move |item: &T| {
                if accept(previous.as_ref(), item) {
                    previous = Some(item.clone());
                    Verdict::Emit
                } else {
                    Verdict::Drop
                }
            })
        })
    }
}
