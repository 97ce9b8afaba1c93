//! Fixed-size buffer slots for in-flight requests.
//!
//! All slots are carved from one page-aligned allocation made when the engine
//! starts, so peak memory is bounded by `buffer_count * buffer_size` and every
//! slot start is suitably aligned for O_DIRECT.
//!
//! ## Slot Spans
//!
//! A request larger than one slot holds a `SlotSpan`: an ordered set of slots
//! acquired all-or-nothing and treated as one logical buffer. The span is
//! handed to the kernel as an iovec array, so a single vectored operation
//! fills or drains all of it.

use crate::runtime::RequestId;
use bytes::{Bytes, BytesMut};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use tracing::warn;

/// Identifier of one slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Returned by `acquire` when not enough slots are free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Slot ownership violations detected on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("{0} is out of range")]
    OutOfRange(SlotId),
    #[error("{0} is not owned")]
    NotOwned(SlotId),
    #[error("{slot} is owned by request {owner}, not {claimed}")]
    WrongOwner {
        slot: SlotId,
        owner: RequestId,
        claimed: RequestId,
    },
}

/// Pool of fixed-capacity slots with exclusive ownership tracking.
///
/// The pool never grows. Ownership is recorded per slot so a slot can only
/// be handed to one request at a time, and releasing a slot the caller does
/// not own is reported instead of silently corrupting the free list.
pub struct BufferPool {
    /// Start of the slot region.
    region: NonNull<u8>,
    /// Layout for deallocation.
    layout: Layout,
    /// Usable bytes per slot.
    slot_size: usize,
    /// Distance between slot starts (slot size rounded up to the alignment).
    stride: usize,
    /// Current owner of each slot.
    owners: Vec<Option<RequestId>>,
    /// Stack of free slots (LIFO for cache locality).
    free_list: Vec<SlotId>,
    /// Set when the region must outlive the pool (kernel may still write).
    leaked: bool,
}

// Safety: the region is plain heap memory owned by the pool. Access to a
// slot's bytes is gated by its ownership record, which is only mutated
// through `&mut self`.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Allocate `count` slots of `size` bytes, each starting on an `align`
    /// boundary.
    pub fn new(count: usize, size: usize, align: usize) -> io::Result<Self> {
        if count == 0 || size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer pool needs at least one non-empty slot",
            ));
        }
        if !align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer alignment must be a power of 2",
            ));
        }

        let stride = size
            .checked_next_multiple_of(align)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "slot size overflow"))?;
        let total = stride
            .checked_mul(count)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pool size overflow"))?;
        let layout = Layout::from_size_align(total, align)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let region = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "failed to allocate buffer pool")
        })?;

        // Reverse so slot 0 is handed out first.
        let free_list = (0..count).rev().map(SlotId).collect();

        Ok(Self {
            region,
            layout,
            slot_size: size,
            stride,
            owners: vec![None; count],
            free_list,
            leaked: false,
        })
    }

    /// Take one free slot for `owner`. Never blocks.
    pub fn acquire(&mut self, owner: RequestId) -> Result<SlotId, Exhausted> {
        let slot = self.free_list.pop().ok_or(Exhausted)?;
        debug_assert!(self.owners[slot.0].is_none(), "free slot has an owner");
        self.owners[slot.0] = Some(owner);
        Ok(slot)
    }

    /// Take `count` slots for `owner`, or none at all.
    pub fn acquire_many(&mut self, count: usize, owner: RequestId) -> Result<Vec<SlotId>, Exhausted> {
        if self.free_list.len() < count {
            return Err(Exhausted);
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(self.acquire(owner)?);
        }
        Ok(slots)
    }

    /// Return a slot owned by `owner` to the free list.
    pub fn release(&mut self, slot: SlotId, owner: RequestId) -> Result<(), ReleaseError> {
        let entry = self
            .owners
            .get_mut(slot.0)
            .ok_or(ReleaseError::OutOfRange(slot))?;
        match *entry {
            None => Err(ReleaseError::NotOwned(slot)),
            Some(current) if current != owner => Err(ReleaseError::WrongOwner {
                slot,
                owner: current,
                claimed: owner,
            }),
            Some(_) => {
                *entry = None;
                self.free_list.push(slot);
                Ok(())
            }
        }
    }

    /// Current owner of a slot.
    pub fn owner(&self, slot: SlotId) -> Option<RequestId> {
        self.owners.get(slot.0).copied().flatten()
    }

    /// Raw pointer to the start of a slot, for building iovecs.
    pub fn slot_ptr(&self, slot: SlotId) -> *mut u8 {
        assert!(slot.0 < self.owners.len(), "slot index out of bounds");
        unsafe { self.region.as_ptr().add(slot.0 * self.stride) }
    }

    /// Read access to a slot.
    ///
    /// # Safety
    /// The kernel must not be writing into this slot.
    pub unsafe fn slot(&self, slot: SlotId) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr(slot), self.slot_size) }
    }

    /// Write access to a slot.
    ///
    /// # Safety
    /// The kernel must not be accessing this slot.
    pub unsafe fn slot_mut(&mut self, slot: SlotId) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(slot), self.slot_size) }
    }

    /// Usable bytes per slot.
    pub fn buffer_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.owners.len()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Slots needed to hold `len` bytes.
    pub fn slots_for(&self, len: usize) -> usize {
        len.div_ceil(self.slot_size)
    }

    /// Largest request the pool could ever hold.
    pub fn max_request(&self) -> usize {
        self.slot_size * self.owners.len()
    }

    /// Keep the region allocated past `Drop`.
    ///
    /// Used when operations are still owned by the kernel at teardown.
    pub fn leak(&mut self) {
        self.leaked = true;
    }

    pub fn is_leaked(&self) -> bool {
        self.leaked
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.leaked {
            warn!(bytes = self.layout.size(), "Leaking buffer region still referenced by kernel");
            return;
        }
        unsafe { dealloc(self.region.as_ptr(), self.layout) };
    }
}

/// An ordered run of slots forming one logical buffer of `len` bytes.
#[derive(Debug)]
pub struct SlotSpan {
    /// Slots in order.
    slots: Vec<SlotId>,
    /// Logical length (last slot may be partially used).
    len: usize,
}

impl SlotSpan {
    /// Acquire enough slots from `pool` to hold `len` bytes.
    pub fn acquire(pool: &mut BufferPool, len: usize, owner: RequestId) -> Result<Self, Exhausted> {
        let slots = pool.acquire_many(pool.slots_for(len), owner)?;
        Ok(Self { slots, len })
    }

    /// Slots in order.
    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Copy `data` into the span from its start.
    ///
    /// # Safety
    /// The kernel must not be accessing any slot of the span.
    pub unsafe fn copy_from(&self, pool: &mut BufferPool, data: &[u8]) {
        assert!(data.len() <= self.len, "data exceeds span length");
        let size = pool.buffer_size();
        for (chunk, &slot) in data.chunks(size).zip(&self.slots) {
            unsafe { pool.slot_mut(slot)[..chunk.len()].copy_from_slice(chunk) };
        }
    }

    /// Assemble the span's bytes into a contiguous buffer.
    ///
    /// # Safety
    /// The kernel must not be writing into any slot of the span.
    pub unsafe fn to_bytes(&self, pool: &BufferPool) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        let mut remaining = self.len;
        for &slot in &self.slots {
            let chunk_len = remaining.min(pool.buffer_size());
            out.extend_from_slice(unsafe { &pool.slot(slot)[..chunk_len] });
            remaining -= chunk_len;
        }
        out.freeze()
    }

    /// Build iovecs covering the span from byte `start` to its end.
    ///
    /// Used to resume a partially completed transfer.
    pub fn iovecs(&self, pool: &BufferPool, start: usize) -> Vec<libc::iovec> {
        if start >= self.len {
            return Vec::new();
        }

        let size = pool.buffer_size();
        let mut iovecs = Vec::with_capacity(self.slots.len());
        let mut remaining = self.len - start;
        let first = start / size;
        let mut skip = start % size;

        for &slot in &self.slots[first..] {
            let chunk_len = (size - skip).min(remaining);
            iovecs.push(libc::iovec {
                iov_base: unsafe { pool.slot_ptr(slot).add(skip) }.cast(),
                iov_len: chunk_len,
            });
            remaining -= chunk_len;
            skip = 0;
            if remaining == 0 {
                break;
            }
        }

        iovecs
    }

    /// Release every slot back to the pool.
    pub fn release(&mut self, pool: &mut BufferPool, owner: RequestId) -> Result<(), ReleaseError> {
        let mut result = Ok(());
        for slot in self.slots.drain(..) {
            if let Err(e) = pool.release(slot, owner) {
                result = Err(e);
            }
        }
        result
    }

    /// Whether the span still holds slots.
    pub fn is_held(&self) -> bool {
        !self.slots.is_empty()
    }
}
