//! Error recovery: `rescue`, `rescue_then_return`, `repeat`.
//!
//! On an upstream error the stage asks a per-subscription handler for a
//! replacement stream and subscribes to it, keeping the downstream
//! subscriber. A replacement that fails synchronously is handled by a loop,
//! not by recursion.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::Error;

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

type Handler<T> = Box<dyn FnMut(&Error) -> Option<Stream<T>>>;
type HandlerFactory<T> = Rc<dyn Fn() -> Handler<T>>;

struct RescueSource<T> {
    upstream: Stream<T>,
    factory: HandlerFactory<T>,
}

impl<T: 'static> Source<T> for RescueSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| RescueStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            handler: RefCell::new((self.factory)()),
            downstream_subscribed: Cell::new(false),
            pending: RefCell::new(None),
            resubscribing: Cell::new(false),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct RescueStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    handler: RefCell<Handler<T>>,
    downstream_subscribed: Cell<bool>,
    pending: RefCell<Option<Stream<T>>>,
    resubscribing: Cell<bool>,
}

impl<T: 'static> RescueStage<T> {
    fn resubscribe(&self, replacement: Stream<T>) {
        *self.pending.borrow_mut() = Some(replacement);
        if self.resubscribing.replace(true) {
            return;
        }
        loop {
            let next = self.pending.borrow_mut().take();
            let Some(next) = next else {
                break;
            };
            if self.link.is_done() {
                break;
            }
            let Some(this) = self.this.upgrade() else {
                break;
            };
            self.link.clear_upstream();
            next.subscribe_rc(this);
        }
        self.resubscribing.set(false);
    }
}

impl<T: 'static> Subscriber<T> for RescueStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        if self.downstream_subscribed.replace(true) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.link.subscribe(this);
        }
    }

    fn on_next(&self, item: T) {
        self.link.next(item);
    }

    fn on_error(&self, error: Error) {
        if self.link.is_done() {
            return;
        }
        let replacement = {
            let mut handler = self.handler.borrow_mut();
            (*handler)(&error)
        };
        match replacement {
            Some(stream) => self.resubscribe(stream),
            None => self.link.error(error),
        }
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

impl<T: 'static> Subscription for RescueStage<T> {
    fn cancel(&self) {
        self.pending.borrow_mut().take();
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn rescue_stage(
        self,
        prefix: &str,
        params: Option<String>,
        factory: impl Fn() -> Handler<T> + 'static,
    ) -> Self {
        Self::stage(
            RescueSource {
                upstream: self,
                factory: Rc::new(factory),
            },
            prefix,
            params,
        )
    }

    /// On error, continues with the stream `handler` returns; `None`
    /// forwards the error.
    ///
    /// The handler also sees errors from the streams it returned.
    #[must_use]
    pub fn rescue(self, handler: impl Fn(&Error) -> Option<Self> + 'static) -> Self {
        let handler = Rc::new(handler);
        self.rescue_stage("rescue", None, move || {
            let handler = Rc::clone(&handler);
            Box::new(move |error: &Error| handler(error))
        })
    }

    /// On error, emits `value` and completes.
    #[must_use]
    pub fn rescue_then_return(self, value: T) -> Self
    where
        T: Clone,
    {
        self.rescue_stage("rescue_then_return", None, move || {
            let value = value.clone();
            Box::new(move |_: &Error| Some(super::source::of([value.clone()])))
        })
    }

    /// On error, re-subscribes to this stream, at most `max_error_count`
    /// times per subscription.
    #[must_use]
    pub fn repeat(self, max_error_count: usize) -> Self {
        self.repeat_bounded(Some(max_error_count))
    }

    /// On error, re-subscribes to this stream without limit.
    #[must_use]
    pub fn repeat_forever(self) -> Self {
        self.repeat_bounded(None)
    }

    fn repeat_bounded(self, max_error_count: Option<usize>) -> Self {
        let params = max_error_count.map(|max| max.to_string());
        let upstream = self.clone();
        self.rescue_stage("repeat", params, move || {
            let upstream = upstream.clone();
            let mut remaining = max_error_count;
            Box::new(move |_: &Error| match remaining.as_mut() {
                None => Some(upstream.clone()),
                Some(0) => None,
                Some(left) => {
                    *left -= 1;
                    Some(upstream.clone())
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::stream;
    use crate::test_utils::{RecordingSubscriber, init_test_logging, install_development_config};
    use std::cell::Cell;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    fn failing_after(items: &[i32], message: &'static str) -> stream::Stream<i32> {
        stream::of(items.to_vec()).append(stream::fail(Error::user(message)))
    }

    #[test]
    fn rescue_switches_to_the_fallback() {
        init_test("rescue_switches_to_the_fallback");
        let recorder = RecordingSubscriber::new();
        failing_after(&[1, 2], "boom")
            .rescue(|_| Some(stream::of([10, 11])))
            .subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec![1, 2, 10, 11], "items", vec![1, 2, 10, 11], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::assert_with_log!(recorder.subscribe_count() == 1, "subscribed once", 1, recorder.subscribe_count());
        crate::test_complete!("rescue_switches_to_the_fallback");
    }

    #[test]
    fn rescue_none_forwards_the_error() {
        init_test("rescue_none_forwards_the_error");
        let recorder = RecordingSubscriber::new();
        failing_after(&[1], "kept").rescue(|_| None).subscribe_rc(recorder.clone());
        let message = recorder.error().and_then(|e| e.message().map(ToString::to_string));
        crate::assert_with_log!(message.as_deref() == Some("kept"), "error", "kept", message);
        crate::test_complete!("rescue_none_forwards_the_error");
    }

    #[test]
    fn rescue_then_return_completes_with_the_value() {
        init_test("rescue_then_return_completes_with_the_value");
        let recorder = RecordingSubscriber::new();
        failing_after(&[1], "boom").rescue_then_return(-1).subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec![1, -1], "items", vec![1, -1], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::test_complete!("rescue_then_return_completes_with_the_value");
    }

    #[test]
    fn repeat_resubscribes_up_to_the_budget() {
        init_test("repeat_resubscribes_up_to_the_budget");
        let subscribes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&subscribes);
        let recorder = RecordingSubscriber::new();
        failing_after(&[7], "again")
            .peek_subscribe(move || counter.set(counter.get() + 1))
            .repeat(2)
            .subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec![7, 7, 7], "items", vec![7, 7, 7], recorder.items());
        crate::assert_with_log!(subscribes.get() == 3, "subscriptions", 3, subscribes.get());
        crate::assert_with_log!(recorder.error().is_some(), "error after budget", true, recorder.error());
        crate::test_complete!("repeat_resubscribes_up_to_the_budget");
    }

    #[test]
    fn repeat_budget_is_per_subscription() {
        init_test("repeat_budget_is_per_subscription");
        let repeated = failing_after(&[1], "again").repeat(1);
        let first = RecordingSubscriber::new();
        let second = RecordingSubscriber::new();
        repeated.subscribe_rc(first.clone());
        repeated.subscribe_rc(second.clone());
        crate::assert_with_log!(first.items() == second.items(), "same", first.items(), second.items());
        crate::assert_with_log!(second.items() == vec![1, 1], "items", vec![1, 1], second.items());
        crate::test_complete!("repeat_budget_is_per_subscription");
    }

    #[test]
    fn deep_synchronous_retries_do_not_recurse() {
        init_test("deep_synchronous_retries_do_not_recurse");
        let recorder = RecordingSubscriber::<i32>::new();
        stream::fail(Error::user("always")).repeat(100_000).subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.error().is_some(), "gave up", true, recorder.error());
        crate::test_complete!("deep_synchronous_retries_do_not_recurse");
    }

    #[test]
    fn repeat_forever_until_cancelled() {
        init_test("repeat_forever_until_cancelled");
        let recorder = RecordingSubscriber::cancelling_after(5);
        failing_after(&[3], "again").repeat_forever().subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items().len() == 5, "items", 5, recorder.items().len());
        crate::assert_with_log!(!recorder.is_terminated(), "no terminal", false, recorder.is_terminated());
        crate::test_complete!("repeat_forever_until_cancelled");
    }
}
