//! Virtual processor units.
//!
//! A [`VirtualProcessorUnit`] is a named execution context that owns one
//! [`Executor`]. Work reaches it as [`Task`]s; the executor decides when the
//! VPU is activated and runs them. While an activation runs, the VPU is
//! *current* on its thread, and no other VPU may become current until it
//! ends. `subscribe_on` and `observe_on` move stream work onto a VPU.
//!
//! ```
//! use std::rc::Rc;
//! use rivulet::vpu::{ManualTrigger, RoundBasedExecutor, VirtualProcessorUnit};
//!
//! let frames = Rc::new(ManualTrigger::new());
//! let vpu = VirtualProcessorUnit::new("frames", RoundBasedExecutor::new(Rc::clone(&frames)));
//! vpu.queue_fn("render", || Ok(()));
//! assert_eq!(frames.fire(), 1);
//! ```

pub mod current;
pub mod executor;
pub mod queue;
pub mod task;

pub use current::{activate, current, deactivate, macro_task};
pub use executor::{
    ActivationTrigger, DeadlineBasedExecutor, DirectExecutor, Executor, ExecutorContext, ManualTrigger,
    RoundBasedExecutor, SchedulerTrigger,
};
pub use queue::TaskQueue;
pub use task::{Task, TaskState};

use core::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

static NEXT_VPU_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct VpuInner {
    id: u64,
    name: String,
    executor: Box<dyn Executor>,
}

/// A named execution context with its own executor.
///
/// Cloning yields another handle to the same VPU.
#[derive(Clone)]
pub struct VirtualProcessorUnit {
    inner: Rc<VpuInner>,
}

impl VirtualProcessorUnit {
    /// Creates a VPU that runs its tasks with `executor`.
    pub fn new(name: impl Into<String>, executor: impl Executor + 'static) -> Self {
        let name = name.into();
        let executor: Box<dyn Executor> = Box::new(executor);
        let inner = Rc::new_cyclic(|vpu| {
            executor.init(ExecutorContext::new(vpu.clone()));
            VpuInner {
                id: NEXT_VPU_ID.fetch_add(1, Ordering::Relaxed),
                name,
                executor,
            }
        });
        Self { inner }
    }

    const fn from_inner(inner: Rc<VpuInner>) -> Self {
        Self { inner }
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Hands `task` to the executor.
    pub fn queue(&self, task: Rc<Task>) {
        self.inner.executor.queue(task);
    }

    /// Wraps `body` in a new task and queues it.
    pub fn queue_fn(&self, name: impl Into<String>, body: impl FnMut() -> Result<()> + 'static) -> Rc<Task> {
        let task = Task::new(name, body);
        self.queue(Rc::clone(&task));
        task
    }

    /// Returns true while this VPU's activation is running.
    #[must_use]
    pub fn is_current(&self) -> bool {
        current().is_some_and(|vpu| vpu == *self)
    }
}

impl PartialEq for VirtualProcessorUnit {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for VirtualProcessorUnit {}

impl fmt::Debug for VirtualProcessorUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualProcessorUnit")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
