//! FIFO of queued tasks.

use std::rc::Rc;

use crate::invariant::ProtocolViolation;
use crate::util::RingBuffer;

use super::task::Task;

const INITIAL_CAPACITY: usize = 100;

/// Tasks waiting for an activation, oldest first.
#[derive(Debug)]
pub struct TaskQueue {
    buffer: RingBuffer<Rc<Task>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(INITIAL_CAPACITY)
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(initial_capacity),
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends `task`. Fails if the task is already queued or disposed.
    pub fn push(&mut self, task: Rc<Task>) -> Result<(), ProtocolViolation> {
        task.mark_queued()?;
        self.buffer.add(task);
        Ok(())
    }

    /// Removes the oldest task.
    pub fn pop(&mut self) -> Option<Rc<Task>> {
        self.buffer.pop()
    }

    /// Disposes and removes every queued task; returns how many there were.
    pub fn purge(&mut self) -> usize {
        let mut purged = 0;
        for task in self.buffer.drain() {
            task.dispose();
            purged += 1;
        }
        purged
    }

    /// Names of the queued tasks, oldest first.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.buffer.iter().map(|task| task.name().to_string()).collect()
    }
}
