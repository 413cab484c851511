//! Test utilities for rivulet.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A subscriber that records every signal it receives
//! - Virtual-time scheduler installation
//!
//! # Example
//! ```
//! use rivulet::stream;
//! use rivulet::test_utils::{RecordingSubscriber, init_test_logging};
//!
//! init_test_logging();
//! let recorder = RecordingSubscriber::new();
//! stream::of([1, 2, 3]).subscribe_rc(recorder.clone());
//! assert_eq!(recorder.items(), vec![1, 2, 3]);
//! assert!(recorder.is_complete());
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use tracing_subscriber::fmt::format::FmtSpan;

use crate::config::{self, EngineConfig};
use crate::error::Error;
use crate::stream::{Subscriber, SubscriptionRef};
use crate::time::{self, SchedulerGuard, TimerScheduler, VirtualClock};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Installs the development profile on this thread and returns it.
pub fn install_development_config() -> EngineConfig {
    let config = EngineConfig::development();
    config::install(config);
    config
}

/// Installs a virtual-clock scheduler on this thread.
///
/// Time stands still until the test calls
/// [`TimerScheduler::advance_by`] or [`TimerScheduler::advance_to`].
#[must_use = "dropping the guard uninstalls the scheduler"]
pub fn install_virtual_scheduler() -> (Rc<TimerScheduler<VirtualClock>>, SchedulerGuard) {
    let scheduler = Rc::new(TimerScheduler::new_virtual());
    let guard = time::set_scheduler(scheduler.clone());
    (scheduler, guard)
}

/// One signal seen by a [`RecordingSubscriber`].
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// `on_subscribe`.
    Subscribe,
    /// `on_next`.
    Next(T),
    /// `on_error`.
    Error(Error),
    /// `on_complete`.
    Complete,
}

/// A subscriber that records every signal, optionally cancelling itself
/// after a number of items.
pub struct RecordingSubscriber<T> {
    signals: RefCell<Vec<Signal<T>>>,
    subscription: RefCell<Option<SubscriptionRef>>,
    cancel_after: Cell<Option<usize>>,
    seen: Cell<usize>,
}

impl<T> RecordingSubscriber<T> {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            signals: RefCell::new(Vec::new()),
            subscription: RefCell::new(None),
            cancel_after: Cell::new(None),
            seen: Cell::new(0),
        })
    }

    /// Creates a recorder that cancels its subscription from inside the
    /// `count`th `on_next`.
    #[must_use]
    pub fn cancelling_after(count: usize) -> Rc<Self> {
        let recorder = Self::new();
        recorder.cancel_after.set(Some(count));
        recorder
    }

    /// The subscription received in `on_subscribe`.
    pub fn subscription(&self) -> Option<SubscriptionRef> {
        self.subscription.borrow().clone()
    }

    /// Cancels the recorded subscription.
    pub fn cancel(&self) {
        let subscription = self.subscription();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Every signal so far, in order.
    pub fn signals(&self) -> Vec<Signal<T>>
    where
        T: Clone,
    {
        self.signals.borrow().clone()
    }

    /// The items received so far.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.signals
            .borrow()
            .iter()
            .filter_map(|signal| match signal {
                Signal::Next(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// The error received, if any.
    pub fn error(&self) -> Option<Error> {
        self.signals.borrow().iter().find_map(|signal| match signal {
            Signal::Error(err) => Some(err.clone()),
            _ => None,
        })
    }

    /// Returns true once `on_complete` arrived.
    pub fn is_complete(&self) -> bool {
        self.signals
            .borrow()
            .iter()
            .any(|signal| matches!(signal, Signal::Complete))
    }

    /// Returns true once a terminal signal arrived.
    pub fn is_terminated(&self) -> bool {
        self.terminal_count() > 0
    }

    /// Number of terminal signals received.
    pub fn terminal_count(&self) -> usize {
        self.signals
            .borrow()
            .iter()
            .filter(|signal| matches!(signal, Signal::Error(_) | Signal::Complete))
            .count()
    }

    /// Number of `on_subscribe` signals received.
    pub fn subscribe_count(&self) -> usize {
        self.signals
            .borrow()
            .iter()
            .filter(|signal| matches!(signal, Signal::Subscribe))
            .count()
    }
}

impl<T> Subscriber<T> for RecordingSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.signals.borrow_mut().push(Signal::Subscribe);
        *self.subscription.borrow_mut() = Some(subscription);
    }

    fn on_next(&self, item: T) {
        self.signals.borrow_mut().push(Signal::Next(item));
        let seen = self.seen.get() + 1;
        self.seen.set(seen);
        if self.cancel_after.get() == Some(seen) {
            self.cancel();
        }
    }

    fn on_error(&self, error: Error) {
        self.signals.borrow_mut().push(Signal::Error(error));
    }

    fn on_complete(&self) {
        self.signals.borrow_mut().push(Signal::Complete);
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
