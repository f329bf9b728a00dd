//! Console Ring Buffer - Bounded byte history for console channels
//!
//! # Purpose
//! Stores the most recent bytes of a console stream in a fixed-capacity
//! circular buffer. Writers never block and never fail: when the buffer is
//! full the oldest byte is dropped to make room.
//!
//! # Integration Points
//! - Provides to: console clients (input and output buffers), the virtio
//!   console adapter (contiguous runs copied straight into guest memory),
//!   frontends holding output the guest has no room for yet
//!
//! # Architecture
//! `head` is the next write position and `tail` the oldest unread byte. The
//! buffer is empty iff `head == tail`, so a buffer with `N` slots holds at
//! most `N - 1` unread bytes.
//!
//! Break markers record out-of-band break events at buffer positions. They
//! are kept in arrival order and consumed from the front. A marker whose
//! following byte is evicted by an overwrite is lost together with the data.
//!
//! # Design
//! - Single owner, no interior mutability: all mutation happens on the
//!   console server's event thread
//! - `get()` never wraps: callers consume one contiguous run at a time
//! - Cumulative byte and line counters are never reset

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;

/// Smallest usable buffer (one slot always stays free)
pub const MIN_CAPACITY: usize = 2;

/// Cursor into a [`RingBuffer`]
///
/// An index only knows the size of the buffer it was taken from, so it can
/// be moved around freely without borrowing the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    pos: usize,
    size: usize,
}

impl Index {
    fn new(pos: usize, size: usize) -> Self {
        debug_assert!(pos < size);
        Self { pos, size }
    }

    /// Physical position inside the backing storage
    pub fn position(self) -> usize {
        self.pos
    }

    /// Index one slot further, wrapping at the end of storage
    pub fn next(self) -> Self {
        let pos = if self.pos + 1 == self.size { 0 } else { self.pos + 1 };
        Self::new(pos, self.size)
    }

    /// Index one slot back, wrapping at the start of storage
    pub fn prev(self) -> Self {
        let pos = if self.pos == 0 { self.size - 1 } else { self.pos - 1 };
        Self::new(pos, self.size)
    }

    /// Index moved by a signed distance, wrapping in both directions
    pub fn offset(self, delta: isize) -> Self {
        let size = self.size as isize;
        let delta = delta.rem_euclid(size) as usize;
        Self::new((self.pos + delta) % self.size, self.size)
    }
}

/// Fixed-capacity circular byte buffer that overwrites its oldest data
pub struct RingBuffer {
    /// Backing storage, never resized
    buf: Box<[u8]>,
    /// Next write position
    head: usize,
    /// Oldest unread position
    tail: usize,
    /// Pending break markers, oldest first
    breaks: VecDeque<usize>,
    /// Bytes ever stored
    sum_bytes: u64,
    /// Newlines ever stored
    sum_lines: u64,
}

impl RingBuffer {
    /// Create an empty buffer with `capacity` slots
    ///
    /// Capacities below [`MIN_CAPACITY`] are raised to it.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            breaks: VecDeque::new(),
            sum_bytes: 0,
            sum_lines: 0,
        }
    }

    /// Number of slots in the backing storage
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Next write position
    pub fn head(&self) -> Index {
        Index::new(self.head, self.buf.len())
    }

    /// Oldest unread position
    pub fn tail(&self) -> Index {
        Index::new(self.tail, self.buf.len())
    }

    /// Check if there is no unread data
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.distance(self.tail(), self.head())
    }

    /// Forward distance from `start` to `end`, always non-negative
    pub fn distance(&self, start: Index, end: Index) -> usize {
        if end.pos >= start.pos {
            end.pos - start.pos
        } else {
            end.pos + self.buf.len() - start.pos
        }
    }

    /// Byte stored at `index`
    pub fn byte_at(&self, index: Index) -> u8 {
        debug_assert_eq!(index.size, self.buf.len());
        self.buf[index.pos % self.buf.len()]
    }

    /// Append a single byte
    ///
    /// # Returns
    /// `true` if the buffer was empty before the call, i.e. a consumer
    /// waiting for data has to be woken up.
    pub fn put(&mut self, byte: u8) -> bool {
        let was_empty = self.is_empty();
        self.store(byte);
        was_empty
    }

    /// Append a byte slice
    ///
    /// Same overwrite and wake-up semantics as [`put`](Self::put).
    pub fn put_slice(&mut self, data: &[u8]) -> bool {
        let was_empty = self.is_empty();
        for &byte in data {
            self.store(byte);
        }
        was_empty
    }

    fn store(&mut self, byte: u8) {
        self.sum_bytes += 1;
        if byte == b'\n' {
            self.sum_lines += 1;
        }

        self.buf[self.head] = byte;
        self.head = self.wrap(self.head + 1);

        // The byte following this marker is about to be overwritten
        if self.breaks.front() == Some(&self.head) {
            self.breaks.pop_front();
        }

        if self.head == self.tail {
            self.tail = self.wrap(self.tail + 1);
        }
    }

    /// Longest contiguous run of unread data starting `offset` bytes after
    /// the tail
    ///
    /// The run ends at the physical end of storage or at the head, whichever
    /// comes first; data past a wrap point needs another call. Returns an
    /// empty slice if `offset` is outside the unread region.
    pub fn get(&self, offset: usize) -> &[u8] {
        if offset >= self.len() {
            return &[];
        }

        let pos = (self.tail + offset) % self.buf.len();
        if pos > self.head {
            &self.buf[pos..]
        } else {
            &self.buf[pos..self.head]
        }
    }

    /// The stored range `[start, end)` as at most two slices
    ///
    /// The second slice is empty unless the range wraps.
    pub fn slices(&self, start: Index, end: Index) -> (&[u8], &[u8]) {
        if start.pos <= end.pos {
            (&self.buf[start.pos..end.pos], &[])
        } else {
            (&self.buf[start.pos..], &self.buf[..end.pos])
        }
    }

    /// Drop `len` bytes from the tail
    ///
    /// Clearing more than is available empties the buffer. Break markers
    /// inside the dropped range are discarded; a marker sitting at the new
    /// tail stays pending.
    pub fn clear(&mut self, len: usize) {
        let len = len.min(self.len());
        if len == 0 {
            return;
        }

        let old_tail = self.tail();
        self.tail = self.wrap(self.tail + len);

        while let Some(&pos) = self.breaks.front() {
            if self.distance(old_tail, Index::new(pos, self.buf.len())) < len {
                self.breaks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Scan forward from `start` for `byte`
    ///
    /// # Returns
    /// The index of the match, or the head if there is none.
    pub fn find_forwards(&self, byte: u8, start: Index) -> Index {
        let mut p = start;
        while p.pos != self.head {
            if self.buf[p.pos] == byte {
                return p;
            }
            p = p.next();
        }
        p
    }

    /// Scan backward from `start` (exclusive) for `byte`
    ///
    /// # Returns
    /// The index of the match, or the tail if there is none.
    pub fn find_backwards(&self, byte: u8, start: Index) -> Index {
        let mut p = start;
        while p.pos != self.tail {
            p = p.prev();
            if self.buf[p.pos] == byte {
                return p;
            }
        }
        p
    }

    /// Record a break event at the current head
    ///
    /// Consecutive breaks without data in between collapse into one.
    ///
    /// # Returns
    /// `true` if there was no unread data when the break arrived.
    pub fn put_break(&mut self) -> bool {
        if self.breaks.back() != Some(&self.head) {
            self.breaks.push_back(self.head);
        }
        self.head == self.tail
    }

    /// Check whether the earliest break marker sits `offset` bytes after the
    /// tail
    pub fn is_next_break(&self, offset: usize) -> bool {
        match self.breaks.front() {
            Some(&pos) => (self.tail + offset) % self.buf.len() == pos,
            None => false,
        }
    }

    /// Consume the earliest break marker
    pub fn clear_next_break(&mut self) {
        self.breaks.pop_front();
    }

    /// Number of pending break markers
    pub fn pending_breaks(&self) -> usize {
        self.breaks.len()
    }

    /// Bytes ever written
    pub fn stat_bytes(&self) -> u64 {
        self.sum_bytes
    }

    /// Newlines ever written
    pub fn stat_lines(&self) -> u64 {
        self.sum_lines
    }

    fn wrap(&self, pos: usize) -> usize {
        if pos >= self.buf.len() {
            pos - self.buf.len()
        } else {
            pos
        }
    }
}

impl core::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.buf.len())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("breaks", &self.breaks)
            .finish()
    }
}
