//! Growable circular queue.
//!
//! `RingBuffer` backs the VPU task queues, the replay window of a hub, the
//! `last(n)` buffer and the overflow queue of `merge`. All of these are FIFO
//! queues that are usually small but must never reject an element, so the
//! buffer starts at a caller-chosen capacity and doubles when full, never
//! shrinking.

use core::fmt;

/// A growable FIFO circular buffer.
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer with room for `capacity` elements.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Number of elements the buffer holds before it has to grow.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of queued elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.slots.len()
    }

    /// Appends at the logical tail.
    pub fn add(&mut self, item: T) {
        if self.len == self.slots.len() {
            self.grow();
        }
        let tail = self.physical(self.len);
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    /// Prepends at the logical head; the next `pop` returns `item`.
    pub fn add_first(&mut self, item: T) {
        if self.len == self.slots.len() {
            self.grow();
        }
        let cap = self.slots.len();
        self.head = (self.head + cap - 1) % cap;
        self.slots[self.head] = Some(item);
        self.len += 1;
    }

    /// Removes and returns the logical head, or `None` when empty.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        if self.len == 0 {
            self.head = 0;
        }
        item
    }

    /// The logical head without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.get(0)
    }

    /// The element at logical `index`, or `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[self.physical(index)].as_ref()
    }

    /// Mutable access to the element at logical `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        let slot = self.physical(index);
        self.slots[slot].as_mut()
    }

    /// Keeps the first `len` elements and drops the rest.
    pub fn truncate(&mut self, len: usize) {
        while self.len > len {
            let last = self.physical(self.len - 1);
            self.slots[last] = None;
            self.len -= 1;
        }
    }

    /// Drops every element; the capacity is kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Iterates from head to tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            index: 0,
        }
    }

    /// Removes every element, yielding them head to tail.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        core::iter::from_fn(move || self.pop())
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(1);
        let mut slots: Vec<Option<T>> = Vec::with_capacity(new_capacity);
        let cap = self.slots.len();
        for i in 0..self.len {
            slots.push(self.slots[(self.head + i) % cap].take());
        }
        slots.resize_with(new_capacity, || None);
        self.slots = slots;
        self.head = 0;
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(10)
    }
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Extend<T> for RingBuffer<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.add(item);
        }
    }
}

/// Head-to-tail iterator over a [`RingBuffer`].
pub struct Iter<'a, T> {
    buffer: &'a RingBuffer<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.buffer.get(self.index)?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.buffer.len - self.index;
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn contents<T: Clone>(buffer: &RingBuffer<T>) -> Vec<T> {
        buffer.iter().cloned().collect()
    }

    #[test]
    fn basic_operation() {
        let mut buffer = RingBuffer::new(3);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.get(0), None);
        assert_eq!(buffer.get(4), None);

        buffer.add("A");
        buffer.add("B");
        buffer.add("C");
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.get(2), Some(&"C"));
        assert_eq!(buffer.get(3), None);

        assert_eq!(buffer.peek(), Some(&"A"));
        assert_eq!(buffer.pop(), Some("A"));
        buffer.add("D");
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(contents(&buffer), vec!["B", "C", "D"]);

        buffer.add("E");
        buffer.add("F");
        buffer.add("G");
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.capacity(), 6);
        assert_eq!(contents(&buffer), vec!["B", "C", "D", "E", "F", "G"]);

        let drained: Vec<_> = buffer.drain().collect();
        assert_eq!(drained, vec!["B", "C", "D", "E", "F", "G"]);
        assert_eq!(buffer.peek(), None);
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn pop_after_wrapping() {
        let mut buffer = RingBuffer::new(3);
        buffer.extend(["A", "B", "C"]);
        assert_eq!(buffer.pop(), Some("A"));
        assert_eq!(buffer.pop(), Some("B"));
        buffer.add("D");
        buffer.add("E");
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.pop(), Some("C"));
        assert_eq!(buffer.pop(), Some("D"));
        assert_eq!(buffer.pop(), Some("E"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn truncate_after_wrapping() {
        let mut buffer = RingBuffer::new(3);
        buffer.extend(["A", "B", "C"]);
        buffer.pop();
        buffer.pop();
        buffer.add("D");
        buffer.add("E");
        buffer.truncate(2);
        assert_eq!(contents(&buffer), vec!["C", "D"]);
        buffer.truncate(5);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn add_first_grows_and_wraps() {
        let mut buffer = RingBuffer::new(3);
        buffer.extend(["A", "B", "C"]);
        buffer.add_first("D");
        assert_eq!(buffer.len(), 4);
        assert_eq!(contents(&buffer), vec!["D", "A", "B", "C"]);
        buffer.clear();

        buffer.add_first("E");
        buffer.add_first("F");
        buffer.add("G");
        assert_eq!(buffer.pop(), Some("F"));
        assert_eq!(buffer.pop(), Some("E"));
        assert_eq!(buffer.pop(), Some("G"));
    }

    #[test]
    fn zero_capacity_grows_on_first_add() {
        let mut buffer = RingBuffer::new(0);
        buffer.add(1);
        buffer.add_first(0);
        assert_eq!(contents(&buffer), vec![0, 1]);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut buffer = RingBuffer::new(2);
        buffer.extend([1, 2]);
        if let Some(first) = buffer.get_mut(0) {
            *first = 10;
        }
        assert_eq!(contents(&buffer), vec![10, 2]);
        assert_eq!(format!("{buffer:?}"), "[10, 2]");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        AddFirst(u8),
        Pop,
        Truncate(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u8>().prop_map(Op::Add),
            2 => any::<u8>().prop_map(Op::AddFirst),
            3 => Just(Op::Pop),
            1 => (0usize..8).prop_map(Op::Truncate),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_vecdeque(capacity in 0usize..6, ops in prop::collection::vec(op(), 0..64)) {
            let mut buffer = RingBuffer::new(capacity);
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::Add(v) => {
                        buffer.add(v);
                        model.push_back(v);
                    }
                    Op::AddFirst(v) => {
                        buffer.add_first(v);
                        model.push_front(v);
                    }
                    Op::Pop => prop_assert_eq!(buffer.pop(), model.pop_front()),
                    Op::Truncate(n) => {
                        buffer.truncate(n);
                        model.truncate(n);
                    }
                }
                prop_assert_eq!(buffer.len(), model.len());
                prop_assert!(buffer.capacity() >= buffer.len());
                prop_assert_eq!(buffer.peek(), model.front());
            }
            let remaining: Vec<u8> = buffer.iter().copied().collect();
            let expected: Vec<u8> = model.into_iter().collect();
            prop_assert_eq!(remaining, expected);
        }
    }
}
