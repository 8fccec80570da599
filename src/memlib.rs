use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
};

use crate::{consts, Error, MemorySource};

/// A fixed-capacity reservation with a movable break
///
/// The whole capacity is reserved up front (from the system allocator, so a `MemLib` can back
/// the global allocator) and the base never moves; `sbrk` just advances the break until the
/// reservation is used up. This is the memory model allocator test drivers
/// usually provide (`mem_sbrk`, `mem_heap_lo`, `mem_heap_hi`).
pub struct MemLib {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

// NOTE(safety) `MemLib` is the only owner of the reservation
unsafe impl Send for MemLib {}

impl MemLib {
    /// Default capacity: 20 MiB
    pub const DEFAULT_CAPACITY: usize = 20 << 20;

    /// Reserves `DEFAULT_CAPACITY` bytes
    pub fn new() -> Result<Self, Error> {
        MemLib::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Reserves `capacity` bytes (rounded up to `ALIGN_SIZE`)
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        let capacity = crate::util::round_up(capacity.max(consts::ALIGN_SIZE), consts::ALIGN_SIZE)
            .filter(|&c| c <= consts::MAX_HEAP_SIZE)
            .ok_or(Error::OutOfMemory {
                requested: capacity,
            })?;

        let layout = Self::layout(capacity)?;
        let base = NonNull::new(unsafe { System.alloc_zeroed(layout) }).ok_or(
            Error::OutOfMemory {
                requested: capacity,
            },
        )?;

        log::debug!("memlib: reserved {} bytes at {:p}", capacity, base);

        Ok(MemLib {
            base,
            capacity,
            brk: 0,
        })
    }

    /// Total bytes the break can advance to
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves the break back to the base; the next allocator built on this source starts over
    pub fn reset(&mut self) {
        self.brk = 0;
    }

    fn layout(capacity: usize) -> Result<Layout, Error> {
        Layout::from_size_align(capacity, 2 * consts::ALIGN_SIZE).map_err(|_| Error::OutOfMemory {
            requested: capacity,
        })
    }
}

unsafe impl MemorySource for MemLib {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.brk
    }

    fn sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, Error> {
        match self.brk.checked_add(incr) {
            Some(brk) if brk <= self.capacity => {
                let old = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
                self.brk = brk;
                Ok(old)
            }
            _ => {
                log::warn!(
                    "memlib: sbrk({}) failed, {} of {} bytes in use",
                    incr,
                    self.brk,
                    self.capacity
                );
                Err(Error::OutOfMemory { requested: incr })
            }
        }
    }
}

impl Drop for MemLib {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.capacity) {
            unsafe { System.dealloc(self.base.as_ptr(), layout) }
        }
    }
}
