//! Moving stream work onto a VPU: `subscribe_on`, `observe_on`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::util::RingBuffer;
use crate::vpu::{Task, VirtualProcessorUnit};

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

const INITIAL_CAPACITY: usize = 10;

struct SubscribeOnSource<T> {
    upstream: Stream<T>,
    vpu: VirtualProcessorUnit,
}

impl<T: 'static> Source<T> for SubscribeOnSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| SubscribeOnStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            task: RefCell::new(None),
        });
        let mut pending = Some((Rc::clone(&stage), self.upstream.clone()));
        let task = Task::new(format!("{}.subscribe_on", self.vpu.name()), move || {
            if let Some((stage, upstream)) = pending.take() {
                stage.task.borrow_mut().take();
                if !stage.link.is_done() {
                    upstream.subscribe_rc(stage);
                }
            }
            Ok(())
        });
        *stage.task.borrow_mut() = Some(Rc::clone(&task));
        self.vpu.queue(task);
        stage
    }
}

struct SubscribeOnStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    task: RefCell<Option<Rc<Task>>>,
}

impl<T: 'static> Subscriber<T> for SubscribeOnStage<T> {
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
    }

    fn on_complete(&self) {
        self.link.complete();
    }
}

impl<T: 'static> Subscription for SubscribeOnStage<T> {
    fn cancel(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.dispose();
        }
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

/// Signals received but not yet re-emitted on the target VPU.
struct Inbox<T> {
    subscription: Option<SubscriptionRef>,
    items: Option<RingBuffer<T>>,
    error: Option<Error>,
    complete: bool,
}

impl<T> Inbox<T> {
    const fn new() -> Self {
        Self {
            subscription: None,
            items: None,
            error: None,
            complete: false,
        }
    }
}

struct ObserveOnSource<T> {
    upstream: Stream<T>,
    vpu: VirtualProcessorUnit,
}

impl<T: 'static> Source<T> for ObserveOnSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this: &Weak<ObserveOnStage<T>>| {
            let owner = this.clone();
            let task = Task::new(format!("{}.observe_on", self.vpu.name()), move || {
                if let Some(stage) = owner.upgrade() {
                    stage.flush();
                }
                Ok(())
            });
            ObserveOnStage {
                this: this.clone(),
                link: Downstream::new(subscriber),
                vpu: self.vpu.clone(),
                task: RefCell::new(Some(task)),
                inbox: RefCell::new(Inbox::new()),
                keep_alive: RefCell::new(None),
            }
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct ObserveOnStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    vpu: VirtualProcessorUnit,
    task: RefCell<Option<Rc<Task>>>,
    inbox: RefCell<Inbox<T>>,
    /// Holds the stage while a flush is queued and nothing downstream has
    /// the subscription yet.
    keep_alive: RefCell<Option<Rc<Self>>>,
}

impl<T: 'static> ObserveOnStage<T> {
    fn schedule(&self) {
        let task = self.task.borrow().clone();
        let Some(task) = task else {
            return;
        };
        if task.is_queued() {
            return;
        }
        *self.keep_alive.borrow_mut() = self.this.upgrade();
        self.vpu.queue(task);
    }

    /// Re-emits in order: subscription, items, terminal signal.
    fn flush(&self) {
        let _held = self.keep_alive.borrow_mut().take();
        let subscription = self.inbox.borrow_mut().subscription.take();
        if let Some(subscription) = subscription {
            self.link.set_upstream(subscription);
            if let Some(this) = self.this.upgrade() {
                self.link.subscribe(this);
            }
        }
        loop {
            if self.link.is_done() {
                return;
            }
            let item = self.inbox.borrow_mut().items.as_mut().and_then(RingBuffer::pop);
            let Some(item) = item else {
                break;
            };
            self.link.next(item);
        }
        let (error, complete) = {
            let mut inbox = self.inbox.borrow_mut();
            (inbox.error.take(), inbox.complete)
        };
        if let Some(error) = error {
            self.release_task();
            self.link.error(error);
        } else if complete {
            self.release_task();
            self.link.complete();
        }
    }

    fn release_task(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.dispose();
        }
    }
}

impl<T: 'static> Subscriber<T> for ObserveOnStage<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.inbox.borrow_mut().subscription = Some(subscription);
        self.schedule();
    }

    fn on_next(&self, item: T) {
        self.inbox
            .borrow_mut()
            .items
            .get_or_insert_with(|| RingBuffer::new(INITIAL_CAPACITY))
            .add(item);
        self.schedule();
    }

    fn on_error(&self, error: Error) {
        self.inbox.borrow_mut().error = Some(error);
        self.schedule();
    }

    fn on_complete(&self) {
        self.inbox.borrow_mut().complete = true;
        self.schedule();
    }
}

impl<T: 'static> Subscription for ObserveOnStage<T> {
    fn cancel(&self) {
        self.release_task();
        let (subscription, _dropped) = {
            let mut inbox = self.inbox.borrow_mut();
            (inbox.subscription.take(), inbox.items.take())
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.link.cancel();
        self.keep_alive.borrow_mut().take();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    /// Subscribes to this stream from a task on `vpu`.
    #[must_use]
    pub fn subscribe_on(self, vpu: &VirtualProcessorUnit) -> Self {
        let name = vpu.name().to_string();
        Self::stage(
            SubscribeOnSource {
                upstream: self,
                vpu: vpu.clone(),
            },
            "subscribe_on",
            Some(name),
        )
    }

    /// Re-emits every signal from a task on `vpu`, in arrival order.
    #[must_use]
    pub fn observe_on(self, vpu: &VirtualProcessorUnit) -> Self {
        let name = vpu.name().to_string();
        Self::stage(
            ObserveOnSource {
                upstream: self,
                vpu: vpu.clone(),
            },
            "observe_on",
            Some(name),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::Hub;
    use crate::stream::{self, EventEmitter};
    use crate::test_utils::{RecordingSubscriber, init_test_logging, install_development_config};
    use crate::vpu::{DirectExecutor, ManualTrigger, RoundBasedExecutor, VirtualProcessorUnit};
    use std::cell::Cell;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    fn manual_vpu(name: &str) -> (VirtualProcessorUnit, Rc<ManualTrigger>) {
        let trigger = Rc::new(ManualTrigger::new());
        let vpu = VirtualProcessorUnit::new(name, RoundBasedExecutor::new(Rc::clone(&trigger)));
        (vpu, trigger)
    }

    #[test]
    fn subscribe_on_defers_the_subscription() {
        init_test("subscribe_on_defers_the_subscription");
        let (vpu, trigger) = manual_vpu("io");
        let recorder = RecordingSubscriber::new();
        stream::of([1, 2]).subscribe_on(&vpu).subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.subscribe_count() == 0, "not yet", 0, recorder.subscribe_count());
        trigger.fire();
        crate::assert_with_log!(recorder.items() == vec![1, 2], "items", vec![1, 2], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::test_complete!("subscribe_on_defers_the_subscription");
    }

    #[test]
    fn subscribe_on_cancelled_before_the_task_runs() {
        init_test("subscribe_on_cancelled_before_the_task_runs");
        let (vpu, trigger) = manual_vpu("io");
        let subscribed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&subscribed);
        let subscription = stream::of([1])
            .peek_subscribe(move || flag.set(true))
            .subscribe_on(&vpu)
            .for_each(|_| {});
        subscription.cancel();
        trigger.fire();
        crate::assert_with_log!(!subscribed.get(), "never subscribed", false, subscribed.get());
        crate::test_complete!("subscribe_on_cancelled_before_the_task_runs");
    }

    #[test]
    fn observe_on_flushes_in_arrival_order() {
        init_test("observe_on_flushes_in_arrival_order");
        let (vpu, trigger) = manual_vpu("ui");
        let hub = Hub::publish();
        let recorder = RecordingSubscriber::new();
        hub.stream().observe_on(&vpu).subscribe_rc(recorder.clone());
        hub.next(1);
        hub.next(2);
        hub.complete();
        crate::assert_with_log!(recorder.subscribe_count() == 0, "buffered", 0, recorder.subscribe_count());
        crate::assert_with_log!(trigger.pending() == 1, "one activation", 1, trigger.pending());
        trigger.fire();
        crate::assert_with_log!(recorder.subscribe_count() == 1, "subscribed", 1, recorder.subscribe_count());
        crate::assert_with_log!(recorder.items() == vec![1, 2], "items", vec![1, 2], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::test_complete!("observe_on_flushes_in_arrival_order");
    }

    #[test]
    fn observe_on_runs_on_the_target_vpu() {
        init_test("observe_on_runs_on_the_target_vpu");
        let vpu = VirtualProcessorUnit::new("direct", DirectExecutor::new());
        let on_vpu = Rc::new(Cell::new(0));
        let counter = Rc::clone(&on_vpu);
        let target = vpu.clone();
        stream::of([1, 2, 3]).observe_on(&vpu).for_each(move |_| {
            if target.is_current() {
                counter.set(counter.get() + 1);
            }
        });
        crate::assert_with_log!(on_vpu.get() == 3, "all on vpu", 3, on_vpu.get());
        crate::test_complete!("observe_on_runs_on_the_target_vpu");
    }

    #[test]
    fn observe_on_cancel_drops_buffered_items() {
        init_test("observe_on_cancel_drops_buffered_items");
        let (vpu, trigger) = manual_vpu("ui");
        let hub = Hub::publish();
        let recorder = RecordingSubscriber::new();
        let subscription = hub.stream().observe_on(&vpu).subscribe_rc(recorder.clone());
        hub.next(1);
        subscription.cancel();
        trigger.fire();
        crate::assert_with_log!(recorder.items().is_empty(), "nothing", 0, recorder.items().len());
        crate::assert_with_log!(hub.subscriber_count() == 0, "upstream cancelled", 0, hub.subscriber_count());
        crate::test_complete!("observe_on_cancel_drops_buffered_items");
    }
}
