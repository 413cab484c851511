//! `timeout`: fail when upstream stays silent for too long.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::time::{self, Cancelable};

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

struct TimeoutSource<T> {
    upstream: Stream<T>,
    window: u64,
}

impl<T: 'static> Source<T> for TimeoutSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| TimeoutStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            window: self.window,
            task: RefCell::new(None),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct TimeoutStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    window: u64,
    task: RefCell<Option<Cancelable>>,
}

impl<T: 'static> TimeoutStage<T> {
    fn cancel_task(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn arm(&self) {
        self.cancel_task();
        let stage = self.this.clone();
        let task = time::schedule(
            move || {
                if let Some(stage) = stage.upgrade() {
                    stage.expire();
                }
            },
            self.window,
        );
        *self.task.borrow_mut() = Some(task);
    }

    fn expire(&self) {
        self.task.borrow_mut().take();
        self.link.cancel_upstream_then_error(Error::timeout(self.window));
    }
}

impl<T: 'static> Subscriber<T> for TimeoutStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.link.set_upstream(subscription);
        if self.link.is_done() {
            return;
        }
        self.arm();
        if let Some(this) = self.this.upgrade() {
            self.link.subscribe(this);
        }
    }

    fn on_next(&self, item: T) {
        if self.link.is_done() {
            return;
        }
        self.arm();
        self.link.next(item);
    }

    fn on_error(&self, error: Error) {
        self.cancel_task();
        self.link.error(error);
    }

    fn on_complete(&self) {
        self.cancel_task();
        self.link.complete();
    }
}

impl<T: 'static> Subscription for TimeoutStage<T> {
    fn cancel(&self) {
        self.cancel_task();
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    /// Fails with a `Timeout` error if no item arrives within `window`
    /// milliseconds of subscribing or of the previous item. Upstream is
    /// cancelled first.
    #[must_use]
    pub fn timeout(self, window: u64) -> Self {
        invariant::check_api(window > 0, || ProtocolViolation::InvalidArgument {
            operator: "timeout",
            detail: "window must be greater than 0".to_string(),
        });
        Self::stage(
            TimeoutSource {
                upstream: self,
                window,
            },
            "timeout",
            Some(window.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::Hub;
    use crate::stream::{self, EventEmitter};
    use crate::test_utils::{
        RecordingSubscriber, init_test_logging, install_development_config, install_virtual_scheduler,
    };
    use std::cell::Cell;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    #[test]
    fn silence_fails_and_cancels_upstream() {
        init_test("silence_fails_and_cancels_upstream");
        let (scheduler, _guard) = install_virtual_scheduler();
        let cancelled = Rc::new(Cell::new(false));
        let flag = Rc::clone(&cancelled);
        let recorder = RecordingSubscriber::<i32>::new();
        stream::never()
            .peek_cancel(move || flag.set(true))
            .timeout(100)
            .subscribe_rc(recorder.clone());
        scheduler.advance_by(99);
        crate::assert_with_log!(!recorder.is_terminated(), "still waiting", false, recorder.is_terminated());
        scheduler.advance_by(1);
        let timed_out = recorder.error().is_some_and(|e| e.is_timeout());
        crate::assert_with_log!(timed_out, "timeout error", true, recorder.error());
        crate::assert_with_log!(cancelled.get(), "upstream cancelled", true, cancelled.get());
        crate::test_complete!("silence_fails_and_cancels_upstream");
    }

    #[test]
    fn each_item_restarts_the_window() {
        init_test("each_item_restarts_the_window");
        let (scheduler, _guard) = install_virtual_scheduler();
        let hub = Hub::publish();
        let recorder = RecordingSubscriber::new();
        hub.stream().timeout(50).subscribe_rc(recorder.clone());
        scheduler.advance_by(40);
        hub.next(1);
        scheduler.advance_by(40);
        hub.next(2);
        scheduler.advance_by(40);
        crate::assert_with_log!(!recorder.is_terminated(), "alive", false, recorder.is_terminated());
        hub.complete();
        scheduler.advance_by(100);
        crate::assert_with_log!(recorder.is_complete(), "completed normally", true, recorder.is_complete());
        crate::assert_with_log!(scheduler.pending_count() == 0, "timer cleared", 0, scheduler.pending_count());
        crate::test_complete!("each_item_restarts_the_window");
    }

    #[test]
    fn cancel_clears_the_timer() {
        init_test("cancel_clears_the_timer");
        let (scheduler, _guard) = install_virtual_scheduler();
        let subscription = stream::never::<i32>().timeout(10).for_each(|_| {});
        crate::assert_with_log!(scheduler.pending_count() == 1, "armed", 1, scheduler.pending_count());
        subscription.cancel();
        crate::assert_with_log!(scheduler.pending_count() == 0, "cleared", 0, scheduler.pending_count());
        crate::test_complete!("cancel_clears_the_timer");
    }
}
