//! Growable circular queue.
//!
//! `RingQueue` keeps its items in a power-of-two sized slot array addressed
//! by a head index and a length, so pushes at the tail and pops at the head
//! are O(1) amortised. The backing array doubles when full and halves when
//! occupancy drops to a quarter, never shrinking below [`MIN_CAPACITY`].

use thiserror::Error;

/// Smallest backing array the queue will ever allocate.
pub const MIN_CAPACITY: usize = 16;

/// Errors returned by [`RingQueue`] accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// `remove` was called on an empty queue.
    #[error("queue is empty")]
    Empty,

    /// The requested index does not address a stored item.
    #[error("index {index} out of range for queue of length {len}")]
    OutOfRange { index: isize, len: usize },
}

/// A FIFO queue over a circular slot array.
#[derive(Debug)]
pub struct RingQueue<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> Default for RingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RingQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: empty_slots(MIN_CAPACITY),
            head: 0,
            len: 0,
        }
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing array. Always a power of two.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append `value` at the tail, doubling the backing array when full.
    pub fn add(&mut self, value: T) {
        if self.len == self.slots.len() {
            self.resize(self.slots.len() * 2);
        }
        let idx = (self.head + self.len) & self.mask();
        self.slots[idx] = Some(value);
        self.len += 1;
    }

    /// Pop the item at the head.
    ///
    /// Halves the backing array once the queue is a quarter full.
    pub fn remove(&mut self) -> Result<T, RingError> {
        if self.len == 0 {
            return Err(RingError::Empty);
        }
        let value = self.slots[self.head].take().ok_or(RingError::Empty)?;
        self.head = (self.head + 1) & self.mask();
        self.len -= 1;

        if self.slots.len() > MIN_CAPACITY && self.len * 4 == self.slots.len() {
            self.resize(self.slots.len() / 2);
        }
        Ok(value)
    }

    /// Item at `index`. Negative indexes count back from the tail, so `-1`
    /// is the most recently added item.
    pub fn get(&self, index: isize) -> Result<&T, RingError> {
        let idx = self.slot_index(index)?;
        self.slots[idx].as_ref().ok_or(RingError::OutOfRange {
            index,
            len: self.len,
        })
    }

    /// Mutable variant of [`Self::get`].
    pub fn get_mut(&mut self, index: isize) -> Result<&mut T, RingError> {
        let idx = self.slot_index(index)?;
        let len = self.len;
        self.slots[idx]
            .as_mut()
            .ok_or(RingError::OutOfRange { index, len })
    }

    /// Item at the head.
    pub fn peek(&self) -> Result<&T, RingError> {
        self.get(0)
    }

    /// Item at the tail.
    pub fn tail(&self) -> Result<&T, RingError> {
        self.get(-1)
    }

    /// Mutable item at the tail.
    pub fn tail_mut(&mut self) -> Result<&mut T, RingError> {
        self.get_mut(-1)
    }

    /// Iterate from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mask = self.mask();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) & mask].as_ref())
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn slot_index(&self, index: isize) -> Result<usize, RingError> {
        let len = self.len as isize;
        let pos = if index < 0 { index + len } else { index };
        if pos < 0 || pos >= len {
            return Err(RingError::OutOfRange {
                index,
                len: self.len,
            });
        }
        Ok((self.head + pos as usize) & self.mask())
    }

    fn resize(&mut self, capacity: usize) {
        let mut slots = empty_slots(capacity);
        let mask = self.mask();
        for (i, slot) in slots.iter_mut().take(self.len).enumerate() {
            *slot = self.slots[(self.head + i) & mask].take();
        }
        self.slots = slots;
        self.head = 0;
    }
}

fn empty_slots<T>(capacity: usize) -> Box<[Option<T>]> {
    (0..capacity).map(|_| None).collect()
}
