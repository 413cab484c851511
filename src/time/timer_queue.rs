//! Deadline-ordered timer storage.
//!
//! Timers live in a [`Slab`]; a min-heap holds `(deadline, id)` entries that
//! point into it. Removing a timer only frees its slot, and heap entries whose
//! slot is gone (or reused by a later timer) are skipped when they surface.

use slab::Slab;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Stable handle to a timer in a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    slot: usize,
    id: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: u64,
    id: u64,
    slot: usize,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first, then FIFO).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Slot<W> {
    id: u64,
    deadline: u64,
    work: Option<W>,
}

/// A min-heap of timers carrying work of type `W`.
#[derive(Debug)]
pub struct TimerQueue<W> {
    heap: BinaryHeap<TimerEntry>,
    slots: Slab<Slot<W>>,
    next_id: u64,
}

impl<W> Default for TimerQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> TimerQueue<W> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Slab::new(),
            next_id: 0,
        }
    }

    /// Number of live timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no timer is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds a timer due at `deadline`.
    pub fn insert(&mut self, deadline: u64, work: W) -> TimerKey {
        let id = self.next_id;
        self.next_id += 1;
        let slot = self.slots.insert(Slot {
            id,
            deadline,
            work: Some(work),
        });
        self.heap.push(TimerEntry { deadline, id, slot });
        TimerKey { slot, id }
    }

    /// Gives a live timer a new deadline. Returns false if it was removed.
    pub fn rearm(&mut self, key: TimerKey, deadline: u64) -> bool {
        let Some(slot) = self.slot_mut(key) else {
            return false;
        };
        slot.deadline = deadline;
        self.heap.push(TimerEntry {
            deadline,
            id: key.id,
            slot: key.slot,
        });
        true
    }

    /// Removes a timer, returning its work if it was not taken.
    pub fn remove(&mut self, key: TimerKey) -> Option<W> {
        self.slot_mut(key)?;
        self.slots.remove(key.slot).work
    }

    /// Takes the work out of a live timer, leaving the timer in place.
    pub fn take(&mut self, key: TimerKey) -> Option<W> {
        self.slot_mut(key)?.work.take()
    }

    /// Puts work back into a live timer. Returns false if it was removed
    /// while the work was out; the work is dropped in that case.
    pub fn restore(&mut self, key: TimerKey, work: W) -> bool {
        match self.slot_mut(key) {
            Some(slot) => {
                slot.work = Some(work);
                true
            }
            None => false,
        }
    }

    /// Returns true if `key` refers to a live timer.
    #[must_use]
    pub fn contains(&self, key: TimerKey) -> bool {
        self.slots.get(key.slot).is_some_and(|slot| slot.id == key.id)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.prune();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the earliest timer due at or before `now`.
    ///
    /// The timer stays live; callers either [`remove`](Self::remove) it or
    /// [`rearm`](Self::rearm) it.
    pub fn pop_due(&mut self, now: u64) -> Option<(TimerKey, u64)> {
        self.prune();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let entry = self.heap.pop()?;
        Some((
            TimerKey {
                slot: entry.slot,
                id: entry.id,
            },
            entry.deadline,
        ))
    }

    /// Drops every timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    fn slot_mut(&mut self, key: TimerKey) -> Option<&mut Slot<W>> {
        self.slots.get_mut(key.slot).filter(|slot| slot.id == key.id)
    }

    fn prune(&mut self) {
        while let Some(entry) = self.heap.peek() {
            let live = self
                .slots
                .get(entry.slot)
                .is_some_and(|slot| slot.id == entry.id && slot.deadline == entry.deadline);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}
