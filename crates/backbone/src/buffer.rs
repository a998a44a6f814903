use std::cell::RefCell;
use std::rc::Rc;

use crate::pool::{ObjectPool, PoolStats, Reusable};

pub const DEFAULT_BUFFER_CAPACITY: usize = 1460;

/// The unit of I/O: a byte block with independent read and write cursors.
/// `capacity` is the nominal size a bundle fills before sealing; the
/// backing storage may exceed it for a stream message's extended header.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    capacity: usize,
    wire_ready: bool,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
            capacity,
            wire_ready: false,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::with_capacity(bytes.len().max(DEFAULT_BUFFER_CAPACITY));
        buffer.data.extend_from_slice(bytes);
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.data.len()
    }

    /// Bytes written but not yet read.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub fn readable_len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn is_full(&self) -> bool {
        self.space() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_consumed(&self) -> bool {
        self.read_pos >= self.data.len()
    }

    /// Appends as much of `bytes` as fits the nominal capacity.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Appends regardless of the nominal capacity.
    pub fn write_unbounded(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn advance(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.data.len());
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.read_pos = self.read_pos.min(len);
    }

    /// Swaps the unread contents for their transport-framed form. Framing
    /// happens once per buffer, right before its first send attempt.
    pub(crate) fn replace_with_wire(&mut self, wire: Vec<u8>) {
        self.data = wire;
        self.read_pos = 0;
        self.wire_ready = true;
    }

    pub(crate) fn is_wire_ready(&self) -> bool {
        self.wire_ready
    }

    pub(crate) fn mark_wire_ready(&mut self) {
        self.wire_ready = true;
    }
}

impl Reusable for Buffer {
    fn reset(&mut self) {
        self.data.clear();
        if self.data.capacity() > self.capacity * 4 {
            self.data.shrink_to(self.capacity);
        }
        self.read_pos = 0;
        self.wire_ready = false;
    }
}

/// Shared handle to the reactor's buffer free-list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<ObjectPool<Buffer>>>,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_free: usize) -> Self {
        let pool = ObjectPool::new("buffer", max_free, move || {
            Buffer::with_capacity(buffer_capacity)
        });
        Self {
            inner: Rc::new(RefCell::new(pool)),
            buffer_capacity,
        }
    }

    pub fn acquire(&self) -> Buffer {
        self.inner.borrow_mut().acquire()
    }

    pub fn release(&self, buffer: Buffer) {
        self.inner.borrow_mut().release(buffer);
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn available(&self) -> usize {
        self.inner.borrow().available()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, 1024)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("available", &self.available())
            .finish()
    }
}
