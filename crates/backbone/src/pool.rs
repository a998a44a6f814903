//! Reactor-local object storage.
//!
//! Two flavours live here. [`Arena`] hands out generation-checked [`Handle`]s
//! for long-lived objects that other tables refer to by id (channels). A
//! released slot bumps its generation, so a stale handle is detected instead
//! of aliasing whatever reuses the slot. [`ObjectPool`] recycles short-lived
//! values (buffers, bundles) by move: release takes ownership, so releasing
//! the same value twice cannot be expressed.
//!
//! Neither type is `Send`: pooled objects belong to the reactor thread.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use thiserror::Error;

type NotSend = PhantomData<Rc<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("stale handle for slot {index} (generation {generation})")]
    Stale { index: u32, generation: u32 },
    #[error("handle slot {0} out of range")]
    OutOfRange(u32),
}

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Rebuilds a handle from its parts, e.g. after it crossed a table
    /// boundary as plain integers. Validity is checked on use.
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self::new(index, generation)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    _not_send: NotSend,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: None,
            len: 0,
            _not_send: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;

        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (*generation, *next_free),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            return Handle::new(index, generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Releases the slot behind `handle`. Releasing a handle twice returns
    /// `Stale` and leaves the slot alone.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T, PoolError> {
        let index = handle.index as usize;
        let live = match self.slots.get(index) {
            None => return Err(PoolError::OutOfRange(handle.index)),
            Some(Slot::Occupied { generation, .. }) => *generation == handle.generation,
            Some(Slot::Vacant { .. }) => false,
        };

        if !live {
            log::warn!("double release of arena handle {:?}", handle);
            return Err(PoolError::Stale {
                index: handle.index,
                generation: handle.generation,
            });
        }

        let vacant = Slot::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = std::mem::replace(&mut self.slots[index], vacant) else {
            unreachable!("slot checked occupied above")
        };
        self.free_head = Some(handle.index);
        self.len -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}

/// Values that can be returned to an [`ObjectPool`] and handed out again.
pub trait Reusable {
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub released: u64,
    pub discarded: u64,
}

pub struct ObjectPool<T: Reusable> {
    name: &'static str,
    free: Vec<T>,
    max_free: usize,
    factory: Box<dyn Fn() -> T>,
    stats: PoolStats,
    _not_send: NotSend,
}

impl<T: Reusable> ObjectPool<T> {
    pub fn new(name: &'static str, max_free: usize, factory: impl Fn() -> T + 'static) -> Self {
        Self {
            name,
            free: Vec::with_capacity(max_free.min(1024)),
            max_free,
            factory: Box::new(factory),
            stats: PoolStats::default(),
            _not_send: PhantomData,
        }
    }

    /// Never blocks: hands out a recycled value or builds a fresh one.
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(value) => {
                self.stats.reused += 1;
                value
            }
            None => {
                self.stats.created += 1;
                (self.factory)()
            }
        }
    }

    pub fn release(&mut self, mut value: T) {
        self.stats.released += 1;
        if self.free.len() < self.max_free {
            value.reset();
            self.free.push(value);
        } else {
            self.stats.discarded += 1;
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn clear(&mut self) {
        log::debug!("{} pool cleared ({} free)", self.name, self.free.len());
        self.free.clear();
    }
}
