//! Fixed set of page-aligned buffers registered with the ring.
//!
//! A slot is either free (in `free`) or held by exactly one read, write or
//! pending-write record. The pool itself only knows free versus held; which
//! holder owns a held slot is tracked by the scheduler and operation table.

use crate::error::{EngineError, EngineResult};
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Index of a registered buffer, as passed to `READ_FIXED`/`WRITE_FIXED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u16);

impl SlotId {
    pub(crate) fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    fn new(size: usize, align: usize) -> EngineResult<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| EngineError::BufferAllocation { size })?;
        // SAFETY: size is non-zero (checked by the pool) and layout is valid.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(EngineError::BufferAllocation { size })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

pub struct BufferPool {
    buffers: Vec<AlignedBuffer>,
    free: Vec<SlotId>,
    held: Vec<bool>,
    capacity: u32,
}

impl BufferPool {
    pub fn new(count: u16, capacity: u32) -> EngineResult<Self> {
        if count == 0 || capacity == 0 {
            return Err(EngineError::InvalidConfiguration {
                field: "buffer pool".to_string(),
                reason: format!("{} buffers of {} bytes", count, capacity),
            });
        }

        let align = page_size();
        let buffers = (0..count)
            .map(|_| AlignedBuffer::new(capacity as usize, align))
            .collect::<EngineResult<Vec<_>>>()?;

        // Reversed so slot 0 is handed out first.
        let free = (0..count).rev().map(SlotId).collect();

        Ok(Self {
            buffers,
            free,
            held: vec![false; count as usize],
            capacity,
        })
    }

    /// Take any free slot. Never blocks.
    pub fn acquire(&mut self) -> Option<SlotId> {
        let slot = self.free.pop()?;
        self.held[slot.0 as usize] = true;
        Some(slot)
    }

    /// Return a held slot.
    ///
    /// # Panics
    ///
    /// If `slot` is out of range or not currently held.
    pub fn release(&mut self, slot: SlotId) {
        let held = self
            .held
            .get_mut(slot.0 as usize)
            .unwrap_or_else(|| panic!("buffer slot {} out of range", slot));
        assert!(*held, "buffer slot {} released while free", slot);
        *held = false;
        self.free.push(slot);
    }

    pub fn is_held(&self, slot: SlotId) -> bool {
        self.held.get(slot.0 as usize).copied().unwrap_or(false)
    }

    /// Capacity of every slot in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn as_ptr(&self, slot: SlotId) -> *const u8 {
        self.buffers[slot.0 as usize].ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self, slot: SlotId) -> *mut u8 {
        self.buffers[slot.0 as usize].ptr.as_ptr()
    }

    /// Registration table, one entry per slot in slot order.
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        self.buffers
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.ptr.as_ptr().cast(),
                iov_len: buf.layout.size(),
            })
            .collect()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffers", &self.buffers.len())
            .field("free", &self.free.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
