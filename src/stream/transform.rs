//! Item transformation: `map`, `map_to`, `scan`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Error;

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

type Mapper<T, U> = Box<dyn FnMut(T) -> U>;
type MapperFactory<T, U> = Rc<dyn Fn() -> Mapper<T, U>>;

struct MapSource<T, U> {
    upstream: Stream<T>,
    factory: MapperFactory<T, U>,
}

impl<T: 'static, U: 'static> Source<U> for MapSource<T, U> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<U>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| MapStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            mapper: RefCell::new((self.factory)()),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct MapStage<T, U> {
    this: Weak<Self>,
    link: Downstream<U>,
    mapper: RefCell<Mapper<T, U>>,
}

impl<T: 'static, U: 'static> Subscriber<T> for MapStage<T, U> {
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
        let mapped = {
            let mut mapper = self.mapper.borrow_mut();
            (*mapper)(item)
        };
        self.link.next(mapped);
    }

    fn on_error(&self, error: Error) {
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

impl<T: 'static, U: 'static> Subscription for MapStage<T, U> {
    fn cancel(&self) {
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn map_stage<U: 'static>(
        self,
        prefix: &str,
        factory: impl Fn() -> Mapper<T, U> + 'static,
    ) -> Stream<U> {
        Stream::stage(
            MapSource {
                upstream: self,
                factory: Rc::new(factory),
            },
            prefix,
            None,
        )
    }

    /// Transforms each item with `f`.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> Stream<U> {
        let f = Rc::new(f);
        self.map_stage("map", move || {
            let f = Rc::clone(&f);
            Box::new(move |item: T| f(item))
        })
    }

    /// Replaces each item with a clone of `value`.
    #[must_use]
    pub fn map_to<U: Clone + 'static>(self, value: U) -> Stream<U> {
        self.map_stage("map_to", move || {
            let value = value.clone();
            Box::new(move |_: T| value.clone())
        })
    }

    /// Emits the running accumulation of `f` over the items, starting from
    /// `initial` for every subscription.
    #[must_use]
    pub fn scan<U: Clone + 'static>(self, initial: U, f: impl Fn(&U, T) -> U + 'static) -> Stream<U> {
        let f = Rc::new(f);
        self.map_stage("scan", move || {
            let f = Rc::clone(&f);
            let mut accumulator = initial.clone();
            Box::new(move |item: T| {
                accumulator = f(&accumulator, item);
                accumulator.clone()
            })
        })
    }
}
