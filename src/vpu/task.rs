//! Named units of deferred work.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, ErrorKind, Result};
use crate::invariant::ProtocolViolation;
use crate::tracing_compat::warn;
use crate::uncaught;

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not in any queue.
    Idle,
    /// Waiting in exactly one queue.
    Queued,
    /// Cancelled; never runs again.
    Disposed,
}

impl TaskState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Disposed => "disposed",
        }
    }
}

type Body = Box<dyn FnMut() -> Result<()>>;

/// A cancelable unit of work queued on a VPU.
///
/// A task is in at most one queue at a time. Once executed it returns to
/// [`TaskState::Idle`] and may be queued again.
pub struct Task {
    name: String,
    body: RefCell<Body>,
    state: Cell<TaskState>,
}

impl Task {
    /// Creates an idle task.
    pub fn new(name: impl Into<String>, body: impl FnMut() -> Result<()> + 'static) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            body: RefCell::new(Box::new(body)),
            state: Cell::new(TaskState::Idle),
        })
    }

    /// Task name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Returns true when the task is waiting in a queue.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.state.get() == TaskState::Queued
    }

    /// Returns true once [`dispose`](Self::dispose) was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.get() == TaskState::Disposed
    }

    /// Cancels the task. A queued task is skipped when its turn comes.
    pub fn dispose(&self) {
        self.state.set(TaskState::Disposed);
    }

    pub(crate) fn mark_queued(&self) -> core::result::Result<(), ProtocolViolation> {
        match self.state.get() {
            TaskState::Idle => {
                self.state.set(TaskState::Queued);
                Ok(())
            }
            TaskState::Queued => Err(ProtocolViolation::TaskAlreadyQueued {
                task: self.name.clone(),
            }),
            TaskState::Disposed => Err(ProtocolViolation::CancelledTaskQueued {
                task: self.name.clone(),
            }),
        }
    }

    /// Runs the body if the task is still queued. An `Err` is reported to
    /// the uncaught-error registry.
    pub(crate) fn execute(&self) {
        if !self.is_queued() {
            return;
        }
        self.state.set(TaskState::Idle);
        let Ok(mut body) = self.body.try_borrow_mut() else {
            warn!(task = %self.name, "task re-entered its own body; skipped");
            return;
        };
        if let Err(err) = (*body)() {
            drop(body);
            let failure = Error::new(ErrorKind::TaskFailed)
                .with_message(format!("task {} failed: {err}", self.name))
                .with_source(err);
            uncaught::report_uncaught_error(&failure);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state.get().as_str())
            .finish_non_exhaustive()
    }
}
