//! Executor backends.
//!
//! An executor owns its VPU's task queue and decides when to activate the
//! VPU. Activation requests go through an [`ActivationTrigger`]: a zero-delay
//! timer of the installed scheduler ([`SchedulerTrigger`]) or an explicit
//! host callback ([`ManualTrigger`]). [`DirectExecutor`] needs no trigger and
//! runs tasks synchronously when no VPU is current.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::config;
use crate::error::Error;
use crate::invariant::{self, ProtocolViolation};
use crate::time;
use crate::tracing_compat::error;

use super::current;
use super::queue::TaskQueue;
use super::task::Task;
use super::{VirtualProcessorUnit, VpuInner};

/// The executor SPI consumed by [`VirtualProcessorUnit`].
pub trait Executor {
    /// Receives the context of the owning VPU. Called once.
    fn init(&self, context: ExecutorContext);

    /// Queues `task` and arranges for it to run.
    fn queue(&self, task: Rc<Task>);

    /// Runs queued work inside an activation of the owning VPU.
    fn activate(&self);
}

/// The owning VPU, as seen by its executor.
#[derive(Clone)]
pub struct ExecutorContext {
    vpu: Weak<VpuInner>,
}

impl fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("vpu", &self.vpu_name())
            .finish()
    }
}

struct ActivationGuard {
    vpu: VirtualProcessorUnit,
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if let Err(violation) = current::deactivate(&self.vpu) {
            if !std::thread::panicking() {
                invariant::fail(&violation);
            }
        }
    }
}

impl ExecutorContext {
    pub(crate) const fn new(vpu: Weak<VpuInner>) -> Self {
        Self { vpu }
    }

    /// The owning VPU, unless it was dropped.
    #[must_use]
    pub fn vpu(&self) -> Option<VirtualProcessorUnit> {
        self.vpu.upgrade().map(VirtualProcessorUnit::from_inner)
    }

    /// Name of the owning VPU.
    #[must_use]
    pub fn vpu_name(&self) -> String {
        self.vpu
            .upgrade()
            .map_or_else(|| "<dropped>".to_string(), |vpu| vpu.name.clone())
    }

    /// Returns true while the owning VPU is current.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.vpu().is_some_and(|vpu| vpu.is_current())
    }

    /// Runs `f` with the owning VPU current.
    ///
    /// Activating while another VPU is current is a violation; `f` does not
    /// run in that case.
    pub fn activate(&self, f: impl FnOnce()) {
        let Some(vpu) = self.vpu() else {
            return;
        };
        if let Err(violation) = current::activate(&vpu) {
            invariant::fail(&violation);
            return;
        }
        let _guard = ActivationGuard { vpu };
        f();
    }

    /// A callback that activates the owning VPU's executor.
    #[must_use]
    pub fn activation(&self) -> Box<dyn FnOnce()> {
        let vpu = self.vpu.clone();
        Box::new(move || {
            if let Some(vpu) = vpu.upgrade() {
                vpu.executor.activate();
            }
        })
    }
}

/// Backend hook that eventually runs an activation callback, once.
pub trait ActivationTrigger {
    /// Arranges for `activation` to run later.
    fn schedule_activation(&self, activation: Box<dyn FnOnce()>);
}

impl<A: ActivationTrigger + ?Sized> ActivationTrigger for Rc<A> {
    fn schedule_activation(&self, activation: Box<dyn FnOnce()>) {
        (**self).schedule_activation(activation);
    }
}

/// Activates through a zero-delay timer of the installed scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerTrigger;

impl ActivationTrigger for SchedulerTrigger {
    fn schedule_activation(&self, activation: Box<dyn FnOnce()>) {
        drop(time::schedule(activation, 0));
    }
}

/// Holds activation requests until the host calls [`fire`](Self::fire).
///
/// Stands in for frame and idle callbacks of an embedding event loop.
#[derive(Default)]
pub struct ManualTrigger {
    pending: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl fmt::Debug for ManualTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTrigger")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ManualTrigger {
    /// Creates a trigger with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of activation requests waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Runs the requests waiting now; requests made meanwhile wait for the
    /// next call. Returns how many ran.
    pub fn fire(&self) -> usize {
        let requests = std::mem::take(&mut *self.pending.borrow_mut());
        let fired = requests.len();
        for activation in requests {
            activation();
        }
        fired
    }
}

impl ActivationTrigger for ManualTrigger {
    fn schedule_activation(&self, activation: Box<dyn FnOnce()>) {
        self.pending.borrow_mut().push(activation);
    }
}

/// Queue and context shared by every backend.
#[derive(Default)]
struct ExecutorCore {
    context: RefCell<Option<ExecutorContext>>,
    queue: RefCell<TaskQueue>,
}

impl ExecutorCore {
    fn init(&self, context: ExecutorContext) {
        let mut slot = self.context.borrow_mut();
        if let Some(existing) = slot.as_ref() {
            let violation = ProtocolViolation::ExecutorReinitialized {
                vpu: existing.vpu_name(),
            };
            drop(slot);
            invariant::fail(&violation);
            return;
        }
        *slot = Some(context);
    }

    fn context(&self) -> Option<ExecutorContext> {
        self.context.borrow().clone()
    }

    fn push(&self, task: Rc<Task>) -> bool {
        let pushed = self.queue.borrow_mut().push(task);
        match pushed {
            Ok(()) => true,
            Err(violation) => {
                invariant::fail(&violation);
                false
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn run_next(&self) -> bool {
        let task = self.queue.borrow_mut().pop();
        task.is_some_and(|task| {
            task.execute();
            true
        })
    }

    /// Runs the tasks queued at the start of the round.
    fn run_round(&self) {
        let count = self.queue.borrow().len();
        for _ in 0..count {
            if !self.run_next() {
                break;
            }
        }
    }

    fn runaway(&self, max_rounds: usize) -> ! {
        let vpu = self
            .context()
            .map_or_else(|| "<uninitialised>".to_string(), |context| context.vpu_name());
        let tasks = self.queue.borrow().task_names();
        if config::purge_tasks_when_runaway_detected() {
            self.queue.borrow_mut().purge();
        }
        error!(vpu = %vpu, max_rounds, pending = tasks.len(), "runaway tasks detected");
        invariant::fatal(&Error::runaway(&vpu, &tasks))
    }
}

/// Clears an executor's running flag even when a task body unwinds, so the
/// next `queue` requests an activation again.
struct RunningGuard<'a> {
    running: &'a Cell<bool>,
}

impl<'a> RunningGuard<'a> {
    fn enter(running: &'a Cell<bool>) -> Self {
        running.set(true);
        Self { running }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

fn check_max_rounds(max_rounds: usize) {
    invariant::check_api(max_rounds > 0, || ProtocolViolation::InvalidArgument {
        operator: "executor",
        detail: "max_rounds must be greater than 0".to_string(),
    });
}

/// Runs one round per activation: the tasks queued when the round starts.
///
/// Tasks queued during a round wait for the next activation. More than
/// `max_rounds` consecutive rounds that leave work behind is a runaway and
/// fatal.
pub struct RoundBasedExecutor<A> {
    core: ExecutorCore,
    trigger: A,
    max_rounds: usize,
    rounds: Cell<usize>,
    armed: Cell<bool>,
    running: Cell<bool>,
}

impl<A: ActivationTrigger> RoundBasedExecutor<A> {
    /// Creates an executor with the configured round budget.
    #[must_use]
    pub fn new(trigger: A) -> Self {
        Self::with_max_rounds(trigger, config::max_rounds())
    }

    /// Creates an executor with an explicit round budget.
    #[must_use]
    pub fn with_max_rounds(trigger: A, max_rounds: usize) -> Self {
        check_max_rounds(max_rounds);
        Self {
            core: ExecutorCore::default(),
            trigger,
            max_rounds: max_rounds.max(1),
            rounds: Cell::new(0),
            armed: Cell::new(false),
            running: Cell::new(false),
        }
    }

    fn schedule_activation(&self) {
        if self.armed.replace(true) {
            return;
        }
        match self.core.context() {
            Some(context) => self.trigger.schedule_activation(context.activation()),
            None => self.armed.set(false),
        }
    }
}

impl<A: ActivationTrigger> Executor for RoundBasedExecutor<A> {
    fn init(&self, context: ExecutorContext) {
        self.core.init(context);
    }

    fn queue(&self, task: Rc<Task>) {
        if self.core.push(task) && !self.running.get() {
            self.schedule_activation();
        }
    }

    fn activate(&self) {
        self.armed.set(false);
        let Some(context) = self.core.context() else {
            return;
        };
        {
            let _running = RunningGuard::enter(&self.running);
            context.activate(|| self.core.run_round());
        }
        if self.core.is_empty() {
            self.rounds.set(0);
            return;
        }
        let rounds = self.rounds.get() + 1;
        if rounds >= self.max_rounds {
            self.rounds.set(0);
            self.core.runaway(self.max_rounds);
        }
        self.rounds.set(rounds);
        self.schedule_activation();
    }
}

impl<A> fmt::Debug for RoundBasedExecutor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundBasedExecutor")
            .field("max_rounds", &self.max_rounds)
            .field("rounds", &self.rounds.get())
            .finish_non_exhaustive()
    }
}

/// Smallest time budget, in milliseconds, worth starting another task in.
const MIN_TASK_TIME: u64 = 1;

/// Runs tasks until the queue empties or the deadline function reports no
/// more than a millisecond left; re-arms if work remains.
pub struct DeadlineBasedExecutor<A> {
    core: ExecutorCore,
    trigger: A,
    time_remaining: Box<dyn Fn() -> u64>,
    armed: Cell<bool>,
    running: Cell<bool>,
}

impl<A: ActivationTrigger> DeadlineBasedExecutor<A> {
    /// `time_remaining` reports the milliseconds left in the current slot.
    pub fn new(trigger: A, time_remaining: impl Fn() -> u64 + 'static) -> Self {
        Self {
            core: ExecutorCore::default(),
            trigger,
            time_remaining: Box::new(time_remaining),
            armed: Cell::new(false),
            running: Cell::new(false),
        }
    }

    fn schedule_activation(&self) {
        if self.armed.replace(true) {
            return;
        }
        match self.core.context() {
            Some(context) => self.trigger.schedule_activation(context.activation()),
            None => self.armed.set(false),
        }
    }
}

impl<A: ActivationTrigger> Executor for DeadlineBasedExecutor<A> {
    fn init(&self, context: ExecutorContext) {
        self.core.init(context);
    }

    fn queue(&self, task: Rc<Task>) {
        if self.core.push(task) && !self.running.get() {
            self.schedule_activation();
        }
    }

    fn activate(&self) {
        self.armed.set(false);
        let Some(context) = self.core.context() else {
            return;
        };
        {
            let _running = RunningGuard::enter(&self.running);
            context.activate(|| {
                while !self.core.is_empty() && (self.time_remaining)() > MIN_TASK_TIME {
                    self.core.run_next();
                }
            });
        }
        if !self.core.is_empty() {
            self.schedule_activation();
        }
    }
}

impl<A> fmt::Debug for DeadlineBasedExecutor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineBasedExecutor").finish_non_exhaustive()
    }
}

/// Runs tasks synchronously when no VPU is current.
///
/// A task queued from inside its own VPU's activation is appended and run
/// by the enclosing drain loop, never recursively.
pub struct DirectExecutor {
    core: ExecutorCore,
    max_rounds: usize,
}

impl Default for DirectExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectExecutor {
    /// Creates an executor with the configured round budget.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_rounds(config::max_rounds())
    }

    /// Creates an executor with an explicit round budget.
    #[must_use]
    pub fn with_max_rounds(max_rounds: usize) -> Self {
        check_max_rounds(max_rounds);
        Self {
            core: ExecutorCore::default(),
            max_rounds: max_rounds.max(1),
        }
    }
}

impl Executor for DirectExecutor {
    fn init(&self, context: ExecutorContext) {
        self.core.init(context);
    }

    fn queue(&self, task: Rc<Task>) {
        let Some(context) = self.core.context().filter(|context| context.vpu().is_some()) else {
            invariant::fail(&ProtocolViolation::ExecutorDetached {
                task: task.name().to_string(),
            });
            return;
        };
        match current::current() {
            None => {
                if self.core.push(task) {
                    self.activate();
                }
            }
            Some(_) if context.is_current() => {
                self.core.push(task);
            }
            Some(other) => invariant::fail(&ProtocolViolation::ForeignVpuActive {
                vpu: context.vpu_name(),
                current: other.name().to_string(),
            }),
        }
    }

    fn activate(&self) {
        let Some(context) = self.core.context() else {
            return;
        };
        context.activate(|| {
            let mut rounds = 0;
            while !self.core.is_empty() {
                if rounds >= self.max_rounds {
                    self.core.runaway(self.max_rounds);
                }
                rounds += 1;
                self.core.run_round();
            }
        });
    }
}

impl fmt::Debug for DirectExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectExecutor")
            .field("max_rounds", &self.max_rounds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Result};
    use crate::test_utils::{init_test_logging, install_development_config, install_virtual_scheduler};
    use crate::uncaught::{self, UncaughtErrorHandler};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    fn log_task(log: &Rc<RefCell<Vec<String>>>, name: &str) -> Rc<Task> {
        let log = Rc::clone(log);
        let label = name.to_string();
        Task::new(name, move || -> Result<()> {
            log.borrow_mut().push(label.clone());
            Ok(())
        })
    }

    #[test]
    fn round_defers_tasks_queued_during_the_round() {
        init_test("round_defers_tasks_queued_during_the_round");
        let trigger = Rc::new(ManualTrigger::new());
        let vpu = VirtualProcessorUnit::new("rounds", RoundBasedExecutor::new(Rc::clone(&trigger)));
        let log = Rc::new(RefCell::new(Vec::new()));
        let follow_up = log_task(&log, "follow_up");
        let inner_vpu = vpu.clone();
        let inner_log = Rc::clone(&log);
        vpu.queue_fn("first", move || {
            inner_log.borrow_mut().push("first".to_string());
            inner_vpu.queue(Rc::clone(&follow_up));
            Ok(())
        });
        vpu.queue(log_task(&log, "second"));
        crate::assert_with_log!(trigger.pending() == 1, "armed once", 1, trigger.pending());
        trigger.fire();
        crate::assert_with_log!(
            *log.borrow() == ["first", "second"],
            "first round",
            "[first, second]",
            log.borrow()
        );
        crate::assert_with_log!(trigger.pending() == 1, "re-armed", 1, trigger.pending());
        trigger.fire();
        crate::assert_with_log!(log.borrow().len() == 3, "second round", 3, log.borrow().len());
        crate::assert_with_log!(trigger.pending() == 0, "idle", 0, trigger.pending());
        crate::test_complete!("round_defers_tasks_queued_during_the_round");
    }

    #[test]
    #[should_panic(expected = "Runaway task(s) detected")]
    fn self_requeueing_task_is_a_runaway() {
        init_test("self_requeueing_task_is_a_runaway");
        let trigger = Rc::new(ManualTrigger::new());
        let vpu = VirtualProcessorUnit::new("spinner", RoundBasedExecutor::with_max_rounds(Rc::clone(&trigger), 3));
        let slot: Rc<RefCell<Option<Rc<Task>>>> = Rc::new(RefCell::new(None));
        let task_slot = Rc::clone(&slot);
        let requeue_vpu = vpu.clone();
        let task = Task::new("spin", move || {
            if let Some(task) = task_slot.borrow().clone() {
                requeue_vpu.queue(task);
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(Rc::clone(&task));
        vpu.queue(task);
        for _ in 0..10 {
            trigger.fire();
        }
    }

    #[test]
    fn macro_task_runs_on_a_zero_delay_timer() {
        init_test("macro_task_runs_on_a_zero_delay_timer");
        let (scheduler, _guard) = install_virtual_scheduler();
        let vpu = VirtualProcessorUnit::new("macro", RoundBasedExecutor::new(SchedulerTrigger));
        let log = Rc::new(RefCell::new(Vec::new()));
        vpu.queue(log_task(&log, "a"));
        crate::assert_with_log!(log.borrow().is_empty(), "deferred", 0, log.borrow().len());
        scheduler.advance_by(0);
        crate::assert_with_log!(*log.borrow() == ["a"], "ran", "[a]", log.borrow());
        crate::test_complete!("macro_task_runs_on_a_zero_delay_timer");
    }

    #[test]
    fn deadline_executor_yields_when_time_runs_out() {
        init_test("deadline_executor_yields_when_time_runs_out");
        let trigger = Rc::new(ManualTrigger::new());
        let budget = Rc::new(Cell::new(3_u64));
        let remaining = Rc::clone(&budget);
        let vpu = VirtualProcessorUnit::new(
            "frames",
            DeadlineBasedExecutor::new(Rc::clone(&trigger), move || {
                let left = remaining.get();
                remaining.set(left.saturating_sub(1));
                left
            }),
        );
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b", "c", "d"] {
            vpu.queue(log_task(&log, name));
        }
        trigger.fire();
        crate::assert_with_log!(*log.borrow() == ["a", "b"], "two fit", "[a, b]", log.borrow());
        crate::assert_with_log!(trigger.pending() == 1, "re-armed", 1, trigger.pending());
        budget.set(10);
        trigger.fire();
        crate::assert_with_log!(log.borrow().len() == 4, "rest ran", 4, log.borrow().len());
        crate::test_complete!("deadline_executor_yields_when_time_runs_out");
    }

    #[test]
    fn direct_executor_runs_inline_without_recursion() {
        init_test("direct_executor_runs_inline_without_recursion");
        let vpu = VirtualProcessorUnit::new("direct", DirectExecutor::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let nested = log_task(&log, "nested");
        let inner_vpu = vpu.clone();
        let inner_log = Rc::clone(&log);
        vpu.queue_fn("outer", move || {
            inner_vpu.queue(Rc::clone(&nested));
            inner_log.borrow_mut().push("outer".to_string());
            Ok(())
        });
        crate::assert_with_log!(
            *log.borrow() == ["outer", "nested"],
            "nested ran after outer",
            "[outer, nested]",
            log.borrow()
        );
        crate::assert_with_log!(!vpu.is_current(), "deactivated", false, vpu.is_current());
        crate::test_complete!("direct_executor_runs_inline_without_recursion");
    }

    #[test]
    #[should_panic(expected = "while")]
    fn direct_executor_rejects_foreign_activation() {
        init_test("direct_executor_rejects_foreign_activation");
        let outer = VirtualProcessorUnit::new("outer", DirectExecutor::new());
        let other = VirtualProcessorUnit::new("other", DirectExecutor::new());
        outer.queue_fn("hop", move || {
            other.queue_fn("inside", || Ok(()));
            Ok(())
        });
    }

    #[test]
    fn failing_task_is_reported_and_executor_continues() {
        init_test("failing_task_is_reported_and_executor_continues");
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let handler: UncaughtErrorHandler = Arc::new(move |err| {
            if err.kind() == ErrorKind::TaskFailed && err.to_string().contains("task broken failed") {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        uncaught::add_uncaught_error_handler(Arc::clone(&handler)).expect("register");
        let vpu = VirtualProcessorUnit::new("direct", DirectExecutor::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        vpu.queue_fn("broken", || Err(Error::user("nope")));
        vpu.queue(log_task(&log, "after"));
        uncaught::remove_uncaught_error_handler(&handler).expect("unregister");
        crate::assert_with_log!(failures.load(Ordering::SeqCst) == 1, "reported", 1, failures.load(Ordering::SeqCst));
        crate::assert_with_log!(*log.borrow() == ["after"], "continued", "[after]", log.borrow());
        crate::test_complete!("failing_task_is_reported_and_executor_continues");
    }

    #[test]
    fn panicking_task_does_not_stall_the_round_executor() {
        init_test("panicking_task_does_not_stall_the_round_executor");
        let trigger = Rc::new(ManualTrigger::new());
        let vpu = VirtualProcessorUnit::new("frames", RoundBasedExecutor::new(Rc::clone(&trigger)));
        vpu.queue_fn("boom", || panic!("task body exploded"));
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| trigger.fire()));
        crate::assert_with_log!(unwound.is_err(), "panic propagated", true, unwound.is_err());
        crate::assert_with_log!(!vpu.is_current(), "deactivated", false, vpu.is_current());

        let log = Rc::new(RefCell::new(Vec::new()));
        vpu.queue(log_task(&log, "after"));
        crate::assert_with_log!(trigger.pending() == 1, "activation requested", 1, trigger.pending());
        trigger.fire();
        crate::assert_with_log!(*log.borrow() == ["after"], "ran", "[after]", log.borrow());
        crate::test_complete!("panicking_task_does_not_stall_the_round_executor");
    }

    #[test]
    fn panicking_task_does_not_stall_the_deadline_executor() {
        init_test("panicking_task_does_not_stall_the_deadline_executor");
        let trigger = Rc::new(ManualTrigger::new());
        let vpu = VirtualProcessorUnit::new("idle", DeadlineBasedExecutor::new(Rc::clone(&trigger), || 16));
        vpu.queue_fn("boom", || panic!("task body exploded"));
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| trigger.fire()));
        crate::assert_with_log!(unwound.is_err(), "panic propagated", true, unwound.is_err());

        let log = Rc::new(RefCell::new(Vec::new()));
        vpu.queue(log_task(&log, "after"));
        crate::assert_with_log!(trigger.pending() == 1, "activation requested", 1, trigger.pending());
        trigger.fire();
        crate::assert_with_log!(*log.borrow() == ["after"], "ran", "[after]", log.borrow());
        crate::test_complete!("panicking_task_does_not_stall_the_deadline_executor");
    }

    #[test]
    #[should_panic(expected = "without a live VPU")]
    fn direct_executor_without_a_vpu_rejects_tasks() {
        init_test("direct_executor_without_a_vpu_rejects_tasks");
        let executor = DirectExecutor::new();
        executor.queue(Task::new("orphan", || Ok(())));
    }
}
