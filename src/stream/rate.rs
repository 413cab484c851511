//! Time-windowed rate limiting: `throttle`, `debounce`, `sample`.
//!
//! The three operators share one stage. At most one item is held back at a
//! time, together with the timer that will release it. Completion that
//! arrives while an item is held waits for the timer; errors and
//! cancellation drop the held item.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::time::{self, Cancelable};

use super::protocol::{Downstream, Source, Stream, Subscriber, SubscriberRef, Subscription, SubscriptionRef};

type TimeoutFn<T> = Rc<dyn Fn(&T) -> u64>;

enum RateKind<T> {
    Throttle(TimeoutFn<T>),
    Debounce(TimeoutFn<T>),
    Sample { period: u64, emit_first: bool },
}

impl<T> Clone for RateKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Throttle(f) => Self::Throttle(Rc::clone(f)),
            Self::Debounce(f) => Self::Debounce(Rc::clone(f)),
            Self::Sample { period, emit_first } => Self::Sample {
                period: *period,
                emit_first: *emit_first,
            },
        }
    }
}

struct RateState<T> {
    next_item: Option<T>,
    task: Option<Cancelable>,
    next_task_time: u64,
    pending_complete: bool,
    next_sample_time: u64,
}

impl<T> Default for RateState<T> {
    fn default() -> Self {
        Self {
            next_item: None,
            task: None,
            next_task_time: 0,
            pending_complete: false,
            next_sample_time: 0,
        }
    }
}

struct RateSource<T> {
    upstream: Stream<T>,
    kind: RateKind<T>,
}

impl<T: 'static> Source<T> for RateSource<T> {
    fn subscribe_raw(&self, subscriber: SubscriberRef<T>) -> SubscriptionRef {
        let stage = Rc::new_cyclic(|this| RateStage {
            this: this.clone(),
            link: Downstream::new(subscriber),
            kind: self.kind.clone(),
            state: RefCell::new(RateState::default()),
        });
        self.upstream.subscribe_rc(stage.clone());
        stage
    }
}

struct RateStage<T> {
    this: Weak<Self>,
    link: Downstream<T>,
    kind: RateKind<T>,
    state: RefCell<RateState<T>>,
}

impl<T: 'static> RateStage<T> {
    /// Drops the held item and its timer.
    fn cancel_pending(&self) {
        let (task, item) = {
            let mut state = self.state.borrow_mut();
            state.next_task_time = 0;
            (state.task.take(), state.next_item.take())
        };
        drop(item);
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn schedule_task(&self, delay: u64) {
        let stage = self.this.clone();
        let task = time::schedule(
            move || {
                if let Some(stage) = stage.upgrade() {
                    stage.state.borrow_mut().task = None;
                    stage.execute_task();
                }
            },
            delay,
        );
        let mut state = self.state.borrow_mut();
        state.task = Some(task);
        state.next_task_time = time::now() + delay;
    }

    fn schedule_for_item(&self, item: T, timeout: u64) {
        if timeout == 0 {
            self.link.next(item);
        } else {
            self.state.borrow_mut().next_item = Some(item);
            self.schedule_task(timeout);
        }
    }

    /// Releases the held item, then completes if completion was deferred.
    fn execute_task(&self) {
        let (item, complete) = {
            let mut state = self.state.borrow_mut();
            if let RateKind::Sample { period, .. } = self.kind {
                state.next_sample_time += period;
            }
            state.task = None;
            state.next_task_time = 0;
            (state.next_item.take(), state.pending_complete)
        };
        if let Some(item) = item {
            self.link.next(item);
        }
        if complete {
            self.cancel_pending();
            self.link.complete();
        }
    }

    fn sample(&self, now: u64, item: T, period: u64, emit_first: bool) {
        let cold_start = {
            let state = self.state.borrow();
            state.next_item.is_none() && now >= state.next_sample_time
        };
        if cold_start {
            self.state.borrow_mut().next_sample_time = now + period;
            if emit_first {
                self.link.next(item);
                return;
            }
        }
        let delay = {
            let mut state = self.state.borrow_mut();
            state.next_item = Some(item);
            state
                .task
                .is_none()
                .then(|| state.next_sample_time.saturating_sub(now).max(1))
        };
        if let Some(delay) = delay {
            self.schedule_task(delay);
        }
    }
}

impl<T: 'static> Subscriber<T> for RateStage<T> {
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
        let now = time::now();
        let overdue = {
            let mut state = self.state.borrow_mut();
            if state.next_item.is_some() && now > state.next_task_time {
                state.task.take()
            } else {
                None
            }
        };
        if let Some(task) = overdue {
            task.cancel();
            self.execute_task();
            if self.link.is_done() {
                return;
            }
        }
        match &self.kind {
            RateKind::Throttle(timeout) => {
                if self.state.borrow().next_item.is_none() {
                    let timeout = timeout(&item);
                    self.schedule_for_item(item, timeout);
                }
            }
            RateKind::Debounce(timeout) => {
                self.cancel_pending();
                let timeout = timeout(&item);
                self.schedule_for_item(item, timeout);
            }
            RateKind::Sample { period, emit_first } => {
                self.sample(now, item, *period, *emit_first);
            }
        }
    }

    fn on_error(&self, error: Error) {
        self.cancel_pending();
        self.link.error(error);
    }

    fn on_complete(&self) {
        let holding = {
            let mut state = self.state.borrow_mut();
            state.pending_complete = state.next_item.is_some();
            state.pending_complete
        };
        if !holding {
            self.cancel_pending();
            self.link.complete();
        }
    }
}

impl<T: 'static> Subscription for RateStage<T> {
    fn cancel(&self) {
        self.cancel_pending();
        self.link.cancel();
    }

    fn is_done(&self) -> bool {
        self.link.is_done()
    }
}

impl<T: 'static> Stream<T> {
    fn rate_stage(self, prefix: &str, params: Option<String>, kind: RateKind<T>) -> Self {
        Self::stage(RateSource { upstream: self, kind }, prefix, params)
    }

    /// Holds the first item of a window and emits it `timeout` milliseconds
    /// later; items arriving meanwhile are dropped.
    #[must_use]
    pub fn throttle(self, timeout: u64) -> Self {
        self.rate_stage(
            "throttle",
            Some(timeout.to_string()),
            RateKind::Throttle(Rc::new(move |_: &T| timeout)),
        )
    }

    /// [`throttle`](Self::throttle) with a window chosen per item.
    #[must_use]
    pub fn throttle_with(self, timeout: impl Fn(&T) -> u64 + 'static) -> Self {
        self.rate_stage("throttle", None, RateKind::Throttle(Rc::new(timeout)))
    }

    /// Emits an item once `timeout` milliseconds pass without a newer one.
    #[must_use]
    pub fn debounce(self, timeout: u64) -> Self {
        self.rate_stage(
            "debounce",
            Some(timeout.to_string()),
            RateKind::Debounce(Rc::new(move |_: &T| timeout)),
        )
    }

    /// [`debounce`](Self::debounce) with a quiet period chosen per item.
    #[must_use]
    pub fn debounce_with(self, timeout: impl Fn(&T) -> u64 + 'static) -> Self {
        self.rate_stage("debounce", None, RateKind::Debounce(Rc::new(timeout)))
    }

    /// Emits the latest item once per `period` milliseconds, emitting the
    /// item that opens a window immediately.
    #[must_use]
    pub fn sample(self, period: u64) -> Self {
        self.sample_with(period, true)
    }

    /// Emits the latest item once per `period` milliseconds. With
    /// `emit_first` the item that opens a window is emitted immediately;
    /// otherwise it waits for the window to close.
    #[must_use]
    pub fn sample_with(self, period: u64, emit_first: bool) -> Self {
        invariant::check_api(period > 0, || ProtocolViolation::InvalidArgument {
            operator: "sample",
            detail: "period must be greater than 0".to_string(),
        });
        self.rate_stage(
            "sample",
            Some(format!("period={period},emit_first={emit_first}")),
            RateKind::Sample { period, emit_first },
        )
    }
}
