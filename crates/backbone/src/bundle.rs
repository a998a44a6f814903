//! Outbound message batches.
//!
//! A [`Bundle`] is a queue of pooled [`Buffer`]s; the last one is the buffer
//! being filled. Callers open a message, append typed fields and finish it.
//! When the assembling buffer runs out of room a new one is acquired, so a
//! message may span buffers on stream transports. In aligned mode (raw
//! datagrams) a message is never split: its partial bytes move to a fresh
//! buffer, and a message that cannot fit one buffer is refused.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::buffer::{Buffer, BufferPool};
use crate::error::{NetError, Result};
use crate::field::Field;
use crate::message::{
    EXTENDED_LENGTH_MARKER, FrameError, MESSAGE_ID_LEN, MESSAGE_LENGTH_EXT_LEN,
    MESSAGE_LENGTH_LEN, MessageSpec,
};
use crate::pool::{ObjectPool, PoolStats, Reusable};

#[derive(Debug, Clone, Copy)]
struct OpenMessage {
    spec: MessageSpec,
    /// Index into `buffers` of the buffer holding the header.
    buffer: usize,
    offset: usize,
    payload_len: usize,
    overflowed: bool,
}

pub struct Bundle {
    pool: BufferPool,
    buffers: VecDeque<Buffer>,
    aligned: bool,
    open: Option<OpenMessage>,
    messages: usize,
}

impl Bundle {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            buffers: VecDeque::new(),
            aligned: false,
            open: None,
            messages: 0,
        }
    }

    pub fn aligned(pool: BufferPool) -> Self {
        let mut bundle = Self::new(pool);
        bundle.aligned = true;
        bundle
    }

    pub fn set_aligned(&mut self, aligned: bool) {
        debug_assert!(self.is_empty(), "alignment changed on a non-empty bundle");
        self.aligned = aligned;
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    fn current(&mut self) -> &mut Buffer {
        if self.buffers.is_empty() {
            let buffer = self.pool.acquire();
            self.buffers.push_back(buffer);
        }
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    fn push_fresh(&mut self) {
        let buffer = self.pool.acquire();
        self.buffers.push_back(buffer);
    }

    /// Starts a message. Any message still open is finished first; a finish
    /// error is returned and the new message is not started.
    pub fn new_message(&mut self, spec: MessageSpec) -> Result<()> {
        if self.open.is_some() {
            self.finish_message()?;
        }

        let header_len = spec.header_len();
        if self.current().space() < header_len {
            self.push_fresh();
        }

        let buffer = self.buffers.len() - 1;
        let current = self.current();
        let offset = current.write_pos();
        current.write_bytes(&spec.id.to_le_bytes());
        if spec.fixed_len.is_none() {
            current.write_bytes(&0u16.to_le_bytes());
        }

        self.open = Some(OpenMessage {
            spec,
            buffer,
            offset,
            payload_len: 0,
            overflowed: false,
        });
        Ok(())
    }

    pub fn write<F: Field>(&mut self, value: &F) {
        value.write_to(self);
    }

    pub fn write_bytes(&mut self, mut bytes: &[u8]) {
        if let Some(open) = self.open.as_mut() {
            open.payload_len += bytes.len();
            if open.overflowed {
                return;
            }
        }

        if self.aligned {
            self.write_aligned(bytes);
            return;
        }

        while !bytes.is_empty() {
            let written = self.current().write_bytes(bytes);
            bytes = &bytes[written..];
            if !bytes.is_empty() {
                self.push_fresh();
            }
        }
    }

    fn write_aligned(&mut self, bytes: &[u8]) {
        if self.current().space() >= bytes.len() {
            self.current().write_bytes(bytes);
            return;
        }

        let Some(open) = self.open else {
            // Outside a message there is nothing to keep together.
            self.push_fresh();
            if self.current().space() >= bytes.len() {
                self.current().write_bytes(bytes);
            } else {
                log::warn!("dropping {} unframed bytes larger than a datagram", bytes.len());
            }
            return;
        };

        if open.offset > 0 {
            let last = self.buffers.len() - 1;
            let partial = self.buffers[last].bytes_mut().split_off(open.offset);
            self.push_fresh();
            let buffer = self.buffers.len() - 1;
            self.current().write_bytes(&partial);
            if let Some(open) = self.open.as_mut() {
                open.buffer = buffer;
                open.offset = 0;
            }
            if self.current().space() >= bytes.len() {
                self.current().write_bytes(bytes);
                return;
            }
        }

        if let Some(open) = self.open.as_mut() {
            open.overflowed = true;
        }
    }

    /// Closes the open message, backpatching its length field.
    pub fn finish_message(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };

        if open.overflowed {
            self.rollback(&open);
            return Err(NetError::MessageTooLarge {
                len: open.spec.header_len() + open.payload_len,
                max: self.pool.buffer_capacity(),
            });
        }

        if let Some(expected) = open.spec.fixed_len {
            if open.payload_len != expected as usize {
                self.rollback(&open);
                return Err(FrameError::FixedLengthMismatch {
                    id: open.spec.id,
                    expected: expected as usize,
                    actual: open.payload_len,
                }
                .into());
            }
            self.messages += 1;
            return Ok(());
        }

        let extended = open.payload_len >= EXTENDED_LENGTH_MARKER as usize;
        if extended && self.aligned {
            self.rollback(&open);
            return Err(NetError::MessageTooLarge {
                len: open.spec.header_len() + open.payload_len,
                max: self.pool.buffer_capacity(),
            });
        }

        let len_at = open.offset + MESSAGE_ID_LEN;
        let data = self.buffers[open.buffer].bytes_mut();
        if extended {
            data[len_at..len_at + MESSAGE_LENGTH_LEN]
                .copy_from_slice(&EXTENDED_LENGTH_MARKER.to_le_bytes());
            let ext_at = len_at + MESSAGE_LENGTH_LEN;
            let ext = (open.payload_len as u32).to_le_bytes();
            data.splice(ext_at..ext_at, ext.iter().copied());
            debug_assert_eq!(ext.len(), MESSAGE_LENGTH_EXT_LEN);
        } else {
            data[len_at..len_at + MESSAGE_LENGTH_LEN]
                .copy_from_slice(&(open.payload_len as u16).to_le_bytes());
        }

        self.messages += 1;
        Ok(())
    }

    fn rollback(&mut self, open: &OpenMessage) {
        while self.buffers.len() > open.buffer + 1 {
            if let Some(buffer) = self.buffers.pop_back() {
                self.pool.release(buffer);
            }
        }
        if let Some(buffer) = self.buffers.get_mut(open.buffer) {
            buffer.truncate(open.offset);
        }
    }

    /// Appends already framed bytes, e.g. a message being relayed verbatim.
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.finish_message()?;
        if self.aligned {
            let max = self.pool.buffer_capacity();
            if bytes.len() > max {
                return Err(NetError::MessageTooLarge {
                    len: bytes.len(),
                    max,
                });
            }
            if self.current().space() < bytes.len() {
                self.push_fresh();
            }
            self.current().write_bytes(bytes);
        } else {
            self.write_bytes(bytes);
        }
        self.messages += 1;
        Ok(())
    }

    pub fn has_open_message(&self) -> bool {
        self.open.is_some()
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Buffer::is_empty)
    }

    /// Bytes still waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.buffers.iter().map(Buffer::readable_len).sum()
    }

    pub fn front_mut(&mut self) -> Option<&mut Buffer> {
        while self.buffers.front().is_some_and(Buffer::is_empty) {
            if let Some(buffer) = self.buffers.pop_front() {
                self.pool.release(buffer);
            }
        }
        self.buffers.front_mut()
    }

    /// Returns the fully sent front buffer to the pool.
    pub fn release_front(&mut self) {
        if let Some(buffer) = self.buffers.pop_front() {
            self.pool.release(buffer);
        }
    }

    pub fn is_drained(&self) -> bool {
        self.buffers.iter().all(Buffer::is_consumed)
    }

    /// Concatenated unsent bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending_len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer.readable());
        }
        out
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    fn release_all(&mut self) {
        for buffer in self.buffers.drain(..) {
            self.pool.release(buffer);
        }
        self.open = None;
        self.messages = 0;
    }
}

impl Reusable for Bundle {
    fn reset(&mut self) {
        self.release_all();
        self.aligned = false;
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("buffers", &self.buffers.len())
            .field("messages", &self.messages)
            .field("pending", &self.pending_len())
            .field("aligned", &self.aligned)
            .finish()
    }
}

#[derive(Clone)]
pub struct BundlePool {
    inner: Rc<RefCell<ObjectPool<Bundle>>>,
    buffers: BufferPool,
}

impl BundlePool {
    pub fn new(buffers: BufferPool, max_free: usize) -> Self {
        let factory_pool = buffers.clone();
        let pool = ObjectPool::new("bundle", max_free, move || {
            Bundle::new(factory_pool.clone())
        });
        Self {
            inner: Rc::new(RefCell::new(pool)),
            buffers,
        }
    }

    pub fn acquire(&self) -> Bundle {
        self.inner.borrow_mut().acquire()
    }

    pub fn acquire_aligned(&self, aligned: bool) -> Bundle {
        let mut bundle = self.acquire();
        bundle.set_aligned(aligned);
        bundle
    }

    pub fn release(&self, bundle: Bundle) {
        self.inner.borrow_mut().release(bundle);
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.borrow().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageReader, MessageTable};

    const STATE: MessageSpec = MessageSpec::variable(20, "state");
    const POS: MessageSpec = MessageSpec::fixed(21, "pos", 12);

    fn table() -> MessageTable {
        MessageTable::with(&[STATE, POS])
    }

    #[test]
    fn test_fields_round_trip_across_buffers() {
        let pool = BufferPool::new(32, 16);
        let mut bundle = Bundle::new(pool);

        bundle.new_message(STATE).unwrap();
        for i in 0..40u32 {
            bundle.write(&i);
            bundle.write(&format!("name-{i}"));
            bundle.write(&(i % 2 == 0));
            bundle.write(&(i as f64 * 0.5));
        }
        bundle.finish_message().unwrap();
        assert!(bundle.buffer_count() > 1);

        let mut reader = MessageReader::default();
        reader.feed(&bundle.to_vec());
        let message = reader.next_message(&table()).unwrap().unwrap();
        let mut fields = message.reader();
        for i in 0..40u32 {
            assert_eq!(fields.read::<u32>().unwrap(), i);
            assert_eq!(fields.read::<String>().unwrap(), format!("name-{i}"));
            assert_eq!(fields.read::<bool>().unwrap(), i % 2 == 0);
            assert_eq!(fields.read::<f64>().unwrap(), i as f64 * 0.5);
        }
        assert_eq!(fields.remaining(), 0);
    }

    #[test]
    fn test_single_buffer_round_trip() {
        let mut bundle = Bundle::new(BufferPool::default());
        bundle.new_message(POS).unwrap();
        bundle.write(&1.0f32);
        bundle.write(&2.0f32);
        bundle.write(&3.0f32);
        bundle.new_message(STATE).unwrap();
        bundle.write(&7u8);
        bundle.finish_message().unwrap();
        assert_eq!(bundle.buffer_count(), 1);
        assert_eq!(bundle.message_count(), 2);

        let mut reader = MessageReader::default();
        reader.feed(&bundle.to_vec());
        let table = table();
        let pos = reader.next_message(&table).unwrap().unwrap();
        assert_eq!(pos.payload.len(), 12);
        let state = reader.next_message(&table).unwrap().unwrap();
        assert_eq!(state.payload, vec![7]);
    }

    #[test]
    fn test_fixed_length_mismatch_rolls_back() {
        let mut bundle = Bundle::new(BufferPool::default());
        bundle.new_message(POS).unwrap();
        bundle.write(&1u8);
        assert!(matches!(
            bundle.finish_message(),
            Err(NetError::Frame(FrameError::FixedLengthMismatch { .. }))
        ));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_extended_length_header() {
        let mut bundle = Bundle::new(BufferPool::new(1460, 128));
        bundle.new_message(STATE).unwrap();
        bundle.write_bytes(&vec![3u8; 70_000]);
        bundle.finish_message().unwrap();

        let wire = bundle.to_vec();
        assert_eq!(wire.len(), 8 + 70_000);
        let mut reader = MessageReader::default();
        reader.feed(&wire);
        let message = reader.next_message(&table()).unwrap().unwrap();
        assert_eq!(message.payload.len(), 70_000);
    }

    #[test]
    fn test_aligned_bundle_keeps_messages_whole() {
        let pool = BufferPool::new(16, 8);
        let mut bundle = Bundle::aligned(pool);
        for i in 0..3u32 {
            bundle.new_message(STATE).unwrap();
            bundle.write(&i);
            bundle.write(&i);
        }
        bundle.finish_message().unwrap();

        // 12 bytes per message, so every buffer holds exactly one.
        assert_eq!(bundle.buffer_count(), 3);
        let table = table();
        for (i, buffer) in bundle.buffers().enumerate() {
            let mut reader = MessageReader::default();
            reader.feed(buffer.readable());
            let message = reader.next_message(&table).unwrap().unwrap();
            assert_eq!(message.reader().read::<u32>().unwrap(), i as u32);
            assert_eq!(reader.buffered(), 0);
        }
    }

    #[test]
    fn test_aligned_bundle_rejects_oversized_message() {
        let pool = BufferPool::new(16, 8);
        let mut bundle = Bundle::aligned(pool);
        bundle.new_message(STATE).unwrap();
        bundle.write_bytes(&[0u8; 40]);
        assert!(matches!(
            bundle.finish_message(),
            Err(NetError::MessageTooLarge { len: 44, max: 16 })
        ));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_drop_returns_buffers() {
        let pool = BufferPool::new(8, 16);
        {
            let mut bundle = Bundle::new(pool.clone());
            bundle.append_raw(&[0u8; 30]).unwrap();
            assert_eq!(bundle.buffer_count(), 4);
        }
        assert_eq!(pool.available(), 4);
    }
}
