//! Broadcast hubs: one producer, many subscribers.
//!
//! A [`Hub`] is pushed to imperatively through [`EventEmitter`] and read
//! through [`Hub::stream`]. What a late subscriber sees first depends on the
//! retention chosen at construction:
//!
//! | Constructor | Late subscriber receives |
//! |---|---|
//! | [`Hub::publish`] | future items only |
//! | [`Hub::current_value`] | the latest item (or the seed), then future items |
//! | [`Hub::replay`] | the retained window, oldest first, then future items |
//!
//! A subscriber arriving after the terminal signal receives the retained
//! items and then that terminal signal.

pub mod connectable;
pub mod multicast;

pub use connectable::ConnectableStream;
pub use multicast::MulticastSubject;

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use slab::Slab;
use smallvec::SmallVec;

use crate::config;
use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::stream::{EventEmitter, Source, Stream, SubscriberRef, Subscription, SubscriptionRef};
use crate::time;
use crate::util::RingBuffer;

const REPLAY_INITIAL_CAPACITY: usize = 10;

struct ReplayWindow<T> {
    entries: RingBuffer<(u64, T)>,
    max_size: Option<usize>,
    max_age: Option<u64>,
}

impl<T: Clone> ReplayWindow<T> {
    fn is_fresh(&self, recorded_at: u64, now: u64) -> bool {
        self.max_age.is_none_or(|age| recorded_at.saturating_add(age) >= now)
    }

    fn record(&mut self, now: u64, item: T) {
        if self.max_size.is_some_and(|max| self.entries.len() >= max) {
            self.entries.pop();
        }
        while let Some(&(recorded_at, _)) = self.entries.peek() {
            if self.is_fresh(recorded_at, now) {
                break;
            }
            self.entries.pop();
        }
        self.entries.add((now, item));
    }

    fn snapshot(&self, now: u64) -> Vec<T> {
        self.entries
            .iter()
            .filter(|(recorded_at, _)| self.is_fresh(*recorded_at, now))
            .map(|(_, item)| item.clone())
            .collect()
    }
}

enum Retention<T> {
    Nothing,
    Current(T),
    Replay(ReplayWindow<T>),
}

impl<T: Clone> Retention<T> {
    fn record(&mut self, item: &T) {
        match self {
            Self::Nothing => {}
            Self::Current(value) => *value = item.clone(),
            Self::Replay(window) => window.record(time::now(), item.clone()),
        }
    }

    fn snapshot(&self) -> Vec<T> {
        match self {
            Self::Nothing => Vec::new(),
            Self::Current(value) => vec![value.clone()],
            Self::Replay(window) => window.snapshot(time::now()),
        }
    }
}

#[derive(Clone)]
enum Terminal {
    Error(Error),
    Complete,
}

impl Terminal {
    const fn label(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Complete => "complete",
        }
    }
}

struct HubEntry<T> {
    subscriber: SubscriberRef<T>,
    subscription: Rc<HubSubscription<T>>,
}

pub(crate) struct HubInner<T> {
    this: Weak<Self>,
    name: Option<Rc<str>>,
    subscribers: RefCell<Slab<HubEntry<T>>>,
    retention: RefCell<Retention<T>>,
    terminal: RefCell<Option<Terminal>>,
    upstreams: RefCell<Vec<SubscriptionRef>>,
}

struct HubSubscription<T> {
    hub: Weak<HubInner<T>>,
    key: Cell<Option<usize>>,
    done: Cell<bool>,
}

impl<T> Subscription for HubSubscription<T> {
    fn cancel(&self) {
        if self.done.replace(true) {
            return;
        }
        if let (Some(hub), Some(key)) = (self.hub.upgrade(), self.key.take()) {
            let removed = hub.subscribers.borrow_mut().try_remove(key);
            drop(removed);
        }
    }

    fn is_done(&self) -> bool {
        self.done.get()
    }
}

impl<T: Clone + 'static> HubInner<T> {
    fn describe(&self) -> String {
        self.name.as_deref().unwrap_or("hub").to_string()
    }

    fn is_done(&self) -> bool {
        self.terminal.borrow().is_some()
    }

    pub(crate) fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let subscription = Rc::new(HubSubscription {
            hub: self.this.clone(),
            key: Cell::new(None),
            done: Cell::new(false),
        });
        subscriber.on_subscribe(subscription.clone());
        let retained = self.retention.borrow().snapshot();
        for item in retained {
            if subscription.is_done() {
                return subscription;
            }
            subscriber.on_next(item);
        }
        if subscription.is_done() {
            return subscription;
        }
        let terminal = self.terminal.borrow().clone();
        match terminal {
            Some(Terminal::Error(error)) => {
                subscription.done.set(true);
                subscriber.on_error(error);
            }
            Some(Terminal::Complete) => {
                subscription.done.set(true);
                subscriber.on_complete();
            }
            None => {
                let key = self.subscribers.borrow_mut().insert(HubEntry {
                    subscriber,
                    subscription: Rc::clone(&subscription),
                });
                subscription.key.set(Some(key));
            }
        }
        subscription
    }

    /// Returns false, after flagging the call, once a terminal signal was
    /// delivered.
    fn accepts(&self, signal: &'static str) -> bool {
        let terminal = self.terminal.borrow().as_ref().map(Terminal::label);
        match terminal {
            None => true,
            Some(terminal) => {
                invariant::check_api(false, || ProtocolViolation::HubSignalAfterTerminal {
                    hub: self.describe(),
                    signal,
                    terminal,
                });
                false
            }
        }
    }

    fn is_live(&self, key: usize, subscriber: &SubscriberRef<T>) -> bool {
        self.subscribers
            .borrow()
            .get(key)
            .is_some_and(|entry| same(&entry.subscriber, subscriber))
    }

    fn next(&self, item: T) {
        if !self.accepts("next") {
            return;
        }
        self.retention.borrow_mut().record(&item);
        let targets: SmallVec<[(usize, SubscriberRef<T>); 8]> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(key, entry)| (key, Rc::clone(&entry.subscriber)))
            .collect();
        for (key, subscriber) in targets {
            if self.is_live(key, &subscriber) {
                subscriber.on_next(item.clone());
            }
        }
    }

    fn terminate(&self, terminal: Terminal) {
        if !self.accepts(terminal.label()) {
            return;
        }
        *self.terminal.borrow_mut() = Some(terminal.clone());
        let entries: Vec<HubEntry<T>> = self.subscribers.borrow_mut().drain().collect();
        let upstreams = std::mem::take(&mut *self.upstreams.borrow_mut());
        for upstream in upstreams {
            upstream.cancel();
        }
        for entry in entries {
            entry.subscription.done.set(true);
            match &terminal {
                Terminal::Error(error) => entry.subscriber.on_error(error.clone()),
                Terminal::Complete => entry.subscriber.on_complete(),
            }
        }
    }

    fn contains(&self, subscriber: &SubscriberRef<T>) -> bool {
        self.subscribers
            .borrow()
            .iter()
            .any(|(_, entry)| same(&entry.subscriber, subscriber))
    }
}

/// Identity of a subscriber, ignoring the vtable half of the pointer.
pub(crate) fn same<T: ?Sized, U: ?Sized>(a: &Rc<T>, b: &Rc<U>) -> bool {
    Rc::as_ptr(a).cast::<()>() == Rc::as_ptr(b).cast::<()>()
}

struct HubSource<T> {
    hub: Rc<HubInner<T>>,
}

impl<T: Clone + 'static> Source<T> for HubSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        self.hub.subscribe_raw(subscriber)
    }
}

/// Fans items pushed into it out to every current subscriber.
///
/// Cloning yields another handle to the same hub.
pub struct Hub<T> {
    inner: Rc<HubInner<T>>,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .field("done", &self.inner.terminal.borrow().is_some())
            .finish()
    }
}

impl<T: Clone + 'static> Hub<T> {
    fn with_retention(retention: Retention<T>, prefix: &str, params: Option<String>) -> Self {
        let name = config::generate_name(None, prefix, params.as_deref()).map(Rc::from);
        let inner = Rc::new_cyclic(|this| HubInner {
            this: this.clone(),
            name,
            subscribers: RefCell::new(Slab::new()),
            retention: RefCell::new(retention),
            terminal: RefCell::new(None),
            upstreams: RefCell::new(Vec::new()),
        });
        Self { inner }
    }

    /// A hub whose subscribers see only items pushed after they subscribe.
    #[must_use]
    pub fn publish() -> Self {
        Self::with_retention(Retention::Nothing, "publish_hub", None)
    }

    /// A hub that hands every new subscriber the latest item, starting from
    /// `initial`.
    #[must_use]
    pub fn current_value(initial: T) -> Self {
        Self::with_retention(Retention::Current(initial), "current_value_hub", None)
    }

    /// A hub that replays retained items to new subscribers.
    ///
    /// At most `max_size` items are kept, and items older than `max_age`
    /// milliseconds are neither kept nor replayed. `None` leaves that bound
    /// off.
    #[must_use]
    pub fn replay(max_size: Option<usize>, max_age: Option<u64>) -> Self {
        invariant::check_api(max_size != Some(0), || ProtocolViolation::InvalidArgument {
            operator: "replay",
            detail: "max_size must be greater than 0".to_string(),
        });
        invariant::check_api(max_age != Some(0), || ProtocolViolation::InvalidArgument {
            operator: "replay",
            detail: "max_age must be greater than 0".to_string(),
        });
        let bound = |value: Option<String>| value.unwrap_or_else(|| "unbound".to_string());
        let params = format!(
            "{},{}",
            bound(max_size.map(|v| v.to_string())),
            bound(max_age.map(|v| v.to_string()))
        );
        let capacity = max_size.map_or(REPLAY_INITIAL_CAPACITY, |max| max.clamp(1, REPLAY_INITIAL_CAPACITY));
        let window = ReplayWindow {
            entries: RingBuffer::new(capacity),
            max_size,
            max_age,
        };
        Self::with_retention(Retention::Replay(window), "replay_hub", Some(params))
    }

    /// The hub's diagnostic name, if names are enabled.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// A stream that subscribes to this hub.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let stream = Stream::from_source(HubSource {
            hub: Rc::clone(&self.inner),
        });
        match self.name() {
            Some(name) => stream.named(name),
            None => stream,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// The latest item of a current-value hub.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        match &*self.inner.retention.borrow() {
            Retention::Current(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Pushes every signal of `stream` into this hub. The forwarding
    /// subscription is cancelled when the hub terminates.
    pub fn forward_from(&self, stream: &Stream<T>) -> SubscriptionRef {
        let subscription = stream.subscribe_emitter(Rc::new(self.clone()));
        if !self.inner.is_done() && !subscription.is_done() {
            let mut upstreams = self.inner.upstreams.borrow_mut();
            upstreams.retain(|upstream| !upstream.is_done());
            upstreams.push(Rc::clone(&subscription));
        }
        subscription
    }

    #[cfg(test)]
    fn forward_count(&self) -> usize {
        self.inner.upstreams.borrow().len()
    }

    pub(crate) fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        self.inner.subscribe_raw(subscriber)
    }

    pub(crate) fn contains(&self, subscriber: &SubscriberRef<T>) -> bool {
        self.inner.contains(subscriber)
    }
}

impl<T: Clone + 'static> EventEmitter<T> for Hub<T> {
    fn next(&self, item: T) {
        self.inner.next(item);
    }

    fn error(&self, error: Error) {
        self.inner.terminate(Terminal::Error(error));
    }

    fn complete(&self) {
        self.inner.terminate(Terminal::Complete);
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;
    use crate::test_utils::{
        RecordingSubscriber, init_test_logging, install_development_config, install_virtual_scheduler,
    };

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    #[test]
    fn publish_sends_only_future_items() {
        init_test("publish_sends_only_future_items");
        let hub = Hub::publish();
        hub.next(1);
        let recorder = RecordingSubscriber::new();
        hub.stream().subscribe_rc(recorder.clone());
        hub.next(2);
        hub.complete();
        crate::assert_with_log!(recorder.items() == vec![2], "future only", vec![2], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::test_complete!("publish_sends_only_future_items");
    }

    #[test]
    fn current_value_starts_with_the_latest() {
        init_test("current_value_starts_with_the_latest");
        let hub = Hub::current_value(0);
        let early = RecordingSubscriber::new();
        hub.stream().subscribe_rc(early.clone());
        hub.next(5);
        let late = RecordingSubscriber::new();
        hub.stream().subscribe_rc(late.clone());
        hub.next(6);
        crate::assert_with_log!(early.items() == vec![0, 5, 6], "seeded", vec![0, 5, 6], early.items());
        crate::assert_with_log!(late.items() == vec![5, 6], "latest", vec![5, 6], late.items());
        crate::assert_with_log!(hub.value() == Some(6), "value", Some(6), hub.value());
        crate::test_complete!("current_value_starts_with_the_latest");
    }

    #[test]
    fn replay_window_by_size() {
        init_test("replay_window_by_size");
        let hub = Hub::replay(Some(2), None);
        hub.next(1);
        hub.next(2);
        hub.next(3);
        let recorder = RecordingSubscriber::new();
        hub.stream().subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec![2, 3], "last two", vec![2, 3], recorder.items());
        hub.next(4);
        crate::assert_with_log!(recorder.items() == vec![2, 3, 4], "then live", vec![2, 3, 4], recorder.items());
        crate::test_complete!("replay_window_by_size");
    }

    #[test]
    fn replay_window_by_age() {
        init_test("replay_window_by_age");
        let (scheduler, _guard) = install_virtual_scheduler();
        let hub = Hub::replay(None, Some(100));
        hub.next("old");
        scheduler.advance_by(60);
        hub.next("new");
        scheduler.advance_by(60);
        let recorder = RecordingSubscriber::new();
        hub.stream().subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec!["new"], "fresh only", vec!["new"], recorder.items());
        crate::test_complete!("replay_window_by_age");
    }

    #[test]
    fn late_subscriber_sees_the_terminal_signal() {
        init_test("late_subscriber_sees_the_terminal_signal");
        let hub = Hub::replay(None, None);
        hub.next(1);
        hub.error(Error::user("closed"));
        let recorder = RecordingSubscriber::new();
        hub.stream().subscribe_rc(recorder.clone());
        crate::assert_with_log!(recorder.items() == vec![1], "replayed", vec![1], recorder.items());
        crate::assert_with_log!(recorder.error().is_some(), "errored", true, recorder.error());
        crate::test_complete!("late_subscriber_sees_the_terminal_signal");
    }

    #[test]
    #[should_panic(expected = "after complete")]
    fn next_after_complete_is_a_violation() {
        init_test("next_after_complete_is_a_violation");
        let hub = Hub::publish();
        hub.complete();
        hub.next(1);
    }

    #[test]
    fn cancel_inside_delivery_stops_later_items() {
        init_test("cancel_inside_delivery_stops_later_items");
        let hub = Hub::publish();
        let first = RecordingSubscriber::cancelling_after(1);
        let second = RecordingSubscriber::new();
        hub.stream().subscribe_rc(first.clone());
        hub.stream().subscribe_rc(second.clone());
        hub.next(1);
        hub.next(2);
        crate::assert_with_log!(first.items() == vec![1], "first stopped", vec![1], first.items());
        crate::assert_with_log!(second.items() == vec![1, 2], "second kept", vec![1, 2], second.items());
        crate::assert_with_log!(hub.subscriber_count() == 1, "one left", 1, hub.subscriber_count());
        crate::test_complete!("cancel_inside_delivery_stops_later_items");
    }

    #[test]
    fn forward_from_feeds_the_hub() {
        init_test("forward_from_feeds_the_hub");
        let hub = Hub::publish();
        let recorder = RecordingSubscriber::new();
        hub.stream().subscribe_rc(recorder.clone());
        hub.forward_from(&stream::of([1, 2, 3]));
        crate::assert_with_log!(recorder.items() == vec![1, 2, 3], "items", vec![1, 2, 3], recorder.items());
        crate::assert_with_log!(recorder.is_complete(), "complete", true, recorder.is_complete());
        crate::assert_with_log!(hub.is_done(), "hub done", true, hub.is_done());
        crate::test_complete!("forward_from_feeds_the_hub");
    }

    #[test]
    fn cancelled_forwards_are_pruned() {
        init_test("cancelled_forwards_are_pruned");
        let target = Hub::<i32>::publish();
        let first = Hub::publish();
        let second = Hub::publish();
        let forward = target.forward_from(&first.stream());
        forward.cancel();
        target.forward_from(&second.stream());
        crate::assert_with_log!(target.forward_count() == 1, "pruned", 1, target.forward_count());
        crate::assert_with_log!(first.subscriber_count() == 0, "released", 0, first.subscriber_count());
        second.next(5);
        crate::assert_with_log!(target.value().is_none(), "publish hub keeps no value", "None", target.value());
        crate::test_complete!("cancelled_forwards_are_pruned");
    }
}
