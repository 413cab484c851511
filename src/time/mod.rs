//! Clocks, timers and the installed scheduler.
//!
//! Time-based operators (`throttle`, `debounce`, `sample`, `timeout`,
//! `periodic`) and the macro-task VPU never hold a scheduler themselves; they
//! go through the functions of this module, which forward to the scheduler
//! installed on the current thread. When none is installed a wall-clock
//! [`TimerScheduler`] is created on first use and driven by the host through
//! [`default_scheduler`].
//!
//! Tests install a virtual scheduler and move time explicitly:
//!
//! ```
//! use std::rc::Rc;
//! use rivulet::time::{self, TimerScheduler};
//!
//! let scheduler = Rc::new(TimerScheduler::new_virtual());
//! let _guard = time::set_scheduler(scheduler.clone());
//! time::schedule(|| println!("fired"), 50);
//! assert_eq!(scheduler.advance_by(50), 1);
//! ```

pub mod clock;
pub mod scheduler;
pub mod timer_queue;

pub use clock::{TimeSource, VirtualClock, WallClock};
pub use scheduler::{Cancelable, Scheduler, TimerScheduler};
pub use timer_queue::{TimerKey, TimerQueue};

use std::cell::RefCell;
use std::rc::Rc;

use crate::invariant::{self, ProtocolViolation};

thread_local! {
    static INSTALLED: RefCell<Option<Rc<dyn Scheduler>>> = const { RefCell::new(None) };
    static DEFAULT: RefCell<Option<Rc<TimerScheduler<WallClock>>>> = const { RefCell::new(None) };
}

/// Restores the previously installed scheduler when dropped.
#[must_use = "dropping the guard uninstalls the scheduler"]
pub struct SchedulerGuard {
    previous: Option<Rc<dyn Scheduler>>,
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        INSTALLED.with(|installed| *installed.borrow_mut() = previous);
    }
}

impl core::fmt::Debug for SchedulerGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerGuard")
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

/// Installs `scheduler` for the current thread until the guard drops.
pub fn set_scheduler(scheduler: Rc<dyn Scheduler>) -> SchedulerGuard {
    let previous = INSTALLED.with(|installed| installed.borrow_mut().replace(scheduler));
    SchedulerGuard { previous }
}

/// The wall-clock scheduler used when nothing is installed.
///
/// Hosts without their own event loop drive it with
/// [`TimerScheduler::run_until_idle`].
#[must_use]
pub fn default_scheduler() -> Rc<TimerScheduler<WallClock>> {
    DEFAULT.with(|default| {
        Rc::clone(
            default
                .borrow_mut()
                .get_or_insert_with(|| Rc::new(TimerScheduler::new())),
        )
    })
}

/// The scheduler in effect on this thread.
#[must_use]
pub fn current() -> Rc<dyn Scheduler> {
    INSTALLED
        .with(|installed| installed.borrow().clone())
        .unwrap_or_else(|| default_scheduler() as Rc<dyn Scheduler>)
}

/// Milliseconds on the current scheduler's clock.
#[must_use]
pub fn now() -> u64 {
    current().now()
}

/// Runs `task` once after `delay` milliseconds.
pub fn schedule(task: impl FnOnce() + 'static, delay: u64) -> Cancelable {
    current().schedule(Box::new(task), delay)
}

/// Runs `task` every `period` milliseconds, first after one period.
pub fn schedule_at_fixed_rate(task: impl FnMut() + 'static, period: u64) -> Cancelable {
    invariant::check_api(period > 0, || ProtocolViolation::ZeroPeriod { period });
    current().schedule_at_fixed_rate(Box::new(task), period)
}
