//! The scheduler SPI and its timer-queue backend.

use core::fmt;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::clock::{TimeSource, VirtualClock, WallClock};
use super::timer_queue::{TimerKey, TimerQueue};
use crate::invariant::{self, ProtocolViolation};
use crate::tracing_compat::trace;

/// Clock plus delayed and periodic task primitives.
///
/// Time is in milliseconds. Periodic tasks first run one period after they
/// are scheduled.
pub trait Scheduler {
    /// Milliseconds since the scheduler started.
    fn now(&self) -> u64;

    /// Runs `task` once, `delay` milliseconds from now.
    fn schedule(&self, task: Box<dyn FnOnce()>, delay: u64) -> Cancelable;

    /// Runs `task` every `period` milliseconds until cancelled.
    fn schedule_at_fixed_rate(&self, task: Box<dyn FnMut()>, period: u64) -> Cancelable;
}

/// Handle to scheduled work. Cancelling consumes the handle.
///
/// Dropping a `Cancelable` leaves the work scheduled.
pub struct Cancelable {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Cancelable {
    /// Wraps the action that cancels the work.
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle whose cancellation does nothing.
    #[must_use]
    pub const fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancels the work. Work that already ran is unaffected.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Cancelable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelable")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

enum Work {
    Once(Box<dyn FnOnce()>),
    Repeating { task: Box<dyn FnMut()>, period: u64 },
}

type Timers = Rc<RefCell<TimerQueue<Work>>>;

/// Scheduler backed by a [`TimerQueue`] and any [`TimeSource`].
///
/// The queue never runs on its own: a host loop calls [`run_due`](Self::run_due)
/// (or [`run_until_idle`](TimerScheduler::run_until_idle) on the wall clock),
/// and tests drive a virtual clock with [`advance_by`](TimerScheduler::advance_by).
pub struct TimerScheduler<C: TimeSource = WallClock> {
    clock: C,
    timers: Timers,
}

impl<C: TimeSource> TimerScheduler<C> {
    /// Creates a scheduler reading `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            timers: Rc::new(RefCell::new(TimerQueue::new())),
        }
    }

    /// The clock this scheduler reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Number of scheduled (not yet cancelled) timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Deadline of the earliest scheduled timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.borrow_mut().next_deadline()
    }

    /// Runs every timer due at the current time, including timers scheduled
    /// by the ones that run. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.clock.now();
            let due = self.timers.borrow_mut().pop_due(now);
            let Some((key, deadline)) = due else {
                break;
            };
            let work = self.timers.borrow_mut().take(key);
            match work {
                Some(Work::Once(task)) => {
                    self.timers.borrow_mut().remove(key);
                    task();
                }
                Some(Work::Repeating { mut task, period }) => {
                    task();
                    let mut timers = self.timers.borrow_mut();
                    if timers.restore(key, Work::Repeating { task, period }) {
                        timers.rearm(key, deadline + period);
                    }
                }
                None => continue,
            }
            fired += 1;
        }
        if fired > 0 {
            trace!(fired, now = self.clock.now(), "timers fired");
        }
        fired
    }

    fn insert(&self, deadline: u64, work: Work) -> Cancelable {
        let key = self.timers.borrow_mut().insert(deadline, work);
        let timers: Weak<RefCell<TimerQueue<Work>>> = Rc::downgrade(&self.timers);
        Cancelable::new(move || remove_timer(&timers, key))
    }
}

fn remove_timer(timers: &Weak<RefCell<TimerQueue<Work>>>, key: TimerKey) {
    let Some(timers) = timers.upgrade() else {
        return;
    };
    // The removed work may own stream stages; drop it after the borrow ends.
    let removed = timers.borrow_mut().remove(key);
    drop(removed);
}

impl<C: TimeSource> Scheduler for TimerScheduler<C> {
    fn now(&self) -> u64 {
        self.clock.now()
    }

    fn schedule(&self, task: Box<dyn FnOnce()>, delay: u64) -> Cancelable {
        let deadline = self.clock.now().saturating_add(delay);
        self.insert(deadline, Work::Once(task))
    }

    fn schedule_at_fixed_rate(&self, task: Box<dyn FnMut()>, period: u64) -> Cancelable {
        invariant::check_api(period > 0, || ProtocolViolation::ZeroPeriod { period });
        let period = period.max(1);
        let deadline = self.clock.now().saturating_add(period);
        self.insert(deadline, Work::Repeating { task, period })
    }
}

impl TimerScheduler<WallClock> {
    /// Creates a wall-clock scheduler starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(WallClock::new())
    }

    /// Sleeps until each deadline and runs timers until none remain.
    ///
    /// Returns immediately when nothing is scheduled; never returns while a
    /// periodic timer is live.
    pub fn run_until_idle(&self) -> usize {
        let mut fired = 0;
        while let Some(deadline) = self.next_deadline() {
            let now = self.clock.now();
            if deadline > now {
                std::thread::sleep(std::time::Duration::from_millis(deadline - now));
            }
            fired += self.run_due();
        }
        fired
    }
}

impl Default for TimerScheduler<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler<VirtualClock> {
    /// Creates a scheduler over a virtual clock at zero.
    #[must_use]
    pub fn new_virtual() -> Self {
        Self::with_clock(VirtualClock::new())
    }

    /// Advances virtual time by `millis`, firing timers in deadline order.
    pub fn advance_by(&self, millis: u64) -> usize {
        self.advance_to(self.clock.now().saturating_add(millis))
    }

    /// Advances virtual time to `target`, moving the clock to each deadline
    /// before firing the timers due then.
    pub fn advance_to(&self, target: u64) -> usize {
        let mut fired = self.run_due();
        while let Some(deadline) = self.next_deadline() {
            if deadline > target {
                break;
            }
            self.clock.advance_to(deadline);
            fired += self.run_due();
        }
        self.clock.advance_to(target);
        fired
    }
}

impl<C: TimeSource> fmt::Debug for TimerScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("now", &self.clock.now())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<(u64, &'static str)>>>, Rc<TimerScheduler<VirtualClock>>) {
        (
            Rc::new(RefCell::new(Vec::new())),
            Rc::new(TimerScheduler::new_virtual()),
        )
    }

    #[test]
    fn delayed_tasks_fire_in_deadline_order() {
        let (log, scheduler) = recorder();
        for (delay, label) in [(30, "c"), (10, "a"), (20, "b")] {
            let log = Rc::clone(&log);
            let clock = Rc::clone(&scheduler);
            scheduler.schedule(
                Box::new(move || log.borrow_mut().push((clock.now(), label))),
                delay,
            );
        }
        assert_eq!(scheduler.advance_by(25), 2);
        assert_eq!(*log.borrow(), vec![(10, "a"), (20, "b")]);
        assert_eq!(scheduler.now(), 25);
        assert_eq!(scheduler.next_deadline(), Some(30));
    }

    #[test]
    fn zero_delay_runs_on_next_drive() {
        let (log, scheduler) = recorder();
        let inner = Rc::clone(&log);
        scheduler.schedule(Box::new(move || inner.borrow_mut().push((0, "now"))), 0);
        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let (log, scheduler) = recorder();
        let inner = Rc::clone(&log);
        let handle = scheduler.schedule(Box::new(move || inner.borrow_mut().push((0, "x"))), 5);
        assert_eq!(scheduler.pending_count(), 1);
        handle.cancel();
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.advance_by(10);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn fixed_rate_first_runs_after_one_period() {
        let scheduler = Rc::new(TimerScheduler::new_virtual());
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let inner = Rc::clone(&ticks);
        let clock = Rc::clone(&scheduler);
        let handle = scheduler.schedule_at_fixed_rate(
            Box::new(move || inner.borrow_mut().push(clock.now())),
            10,
        );
        scheduler.advance_by(35);
        assert_eq!(*ticks.borrow(), vec![10, 20, 30]);
        handle.cancel();
        scheduler.advance_by(100);
        assert_eq!(ticks.borrow().len(), 3);
    }

    #[test]
    fn periodic_task_can_cancel_itself() {
        let scheduler = Rc::new(TimerScheduler::new_virtual());
        let handle: Rc<RefCell<Option<Cancelable>>> = Rc::new(RefCell::new(None));
        let count = Rc::new(Cell::new(0));
        let (inner_handle, inner_count) = (Rc::clone(&handle), Rc::clone(&count));
        let cancelable = scheduler.schedule_at_fixed_rate(
            Box::new(move || {
                inner_count.set(inner_count.get() + 1);
                if inner_count.get() == 2 {
                    if let Some(h) = inner_handle.borrow_mut().take() {
                        h.cancel();
                    }
                }
            }),
            5,
        );
        *handle.borrow_mut() = Some(cancelable);
        scheduler.advance_by(50);
        assert_eq!(count.get(), 2);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn tasks_scheduled_while_firing_respect_their_deadline() {
        let scheduler = Rc::new(TimerScheduler::new_virtual());
        let log = Rc::new(RefCell::new(Vec::new()));
        let (inner_sched, inner_log) = (Rc::clone(&scheduler), Rc::clone(&log));
        scheduler.schedule(
            Box::new(move || {
                inner_log.borrow_mut().push(inner_sched.now());
                let log = Rc::clone(&inner_log);
                let clock = Rc::clone(&inner_sched);
                inner_sched.schedule(Box::new(move || log.borrow_mut().push(clock.now())), 15);
            }),
            10,
        );
        scheduler.advance_by(20);
        assert_eq!(*log.borrow(), vec![10]);
        scheduler.advance_by(5);
        assert_eq!(*log.borrow(), vec![10, 25]);
    }

    #[test]
    #[should_panic(expected = "period greater than 0")]
    fn zero_period_is_rejected() {
        crate::config::install(crate::config::EngineConfig::development());
        let scheduler = TimerScheduler::new_virtual();
        let _ = scheduler.schedule_at_fixed_rate(Box::new(|| {}), 0);
    }

    #[test]
    fn wall_clock_run_until_idle_drains() {
        let scheduler = TimerScheduler::new();
        let ran = Rc::new(Cell::new(false));
        let inner = Rc::clone(&ran);
        scheduler.schedule(Box::new(move || inner.set(true)), 1);
        assert_eq!(scheduler.run_until_idle(), 1);
        assert!(ran.get());
    }
}
