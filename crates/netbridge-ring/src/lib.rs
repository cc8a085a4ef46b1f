//! Fixed-capacity packet ring with drop-oldest overflow.
//!
//! Design goals:
//! - One allocation at construction, none afterwards.
//! - Appending never fails: when the ring is full the oldest item is overwritten (and dropped).
//!   This is a bounded-loss policy, not an error.
//! - Popping never blocks and returns whatever is available, up to a caller-supplied budget.
//! - No internal synchronization. Callers wrap the ring in their own lock, which lets the same type
//!   back device RX/TX queues and any other single-lock queue.
#![forbid(unsafe_code)]

/// Default number of slots, matching the device packet batch size.
pub const DEFAULT_RING_CAPACITY: usize = 256;

pub struct PacketRing<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    full: bool,
    dropped: u64,
}

impl<T> PacketRing<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            full: false,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of queued items: `(tail - head + N) % N`, or `N` when full.
    pub fn len(&self) -> usize {
        if self.full {
            return self.capacity();
        }
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Total number of items overwritten by [`PacketRing::push`]/[`PacketRing::append`] since
    /// construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Store `item` at the tail.
    ///
    /// If the ring was full, the oldest item is displaced and returned so the caller decides how it
    /// is released. The displaced item is counted in [`PacketRing::dropped`].
    pub fn push(&mut self, item: T) -> Option<T> {
        let tail = self.tail;
        let displaced = self.slots[tail].replace(item);

        self.tail = (tail + 1) % self.capacity();
        if self.full {
            self.head = self.tail;
        }
        self.full = self.head == self.tail;

        if displaced.is_some() {
            self.dropped += 1;
        }
        displaced
    }

    /// Append every item in order, dropping overwritten items. Returns the number of items stored.
    pub fn append<I: IntoIterator<Item = T>>(&mut self, items: I) -> usize {
        let mut stored = 0;
        for item in items {
            drop(self.push(item));
            stored += 1;
        }
        stored
    }

    /// Remove the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let head = self.head;
        let item = self.slots[head].take();
        self.head = (head + 1) % self.capacity();
        self.full = false;
        item
    }

    /// Move up to `max` items into `out` in FIFO order. Returns the number of items moved.
    pub fn pop_into(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut popped = 0;
        while popped < max {
            let Some(item) = self.pop() else {
                break;
            };
            out.push(item);
            popped += 1;
        }
        popped
    }

    /// Drop every queued item.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.full = false;
    }
}

impl<T> Default for PacketRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for PacketRing<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}
