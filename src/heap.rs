use core::{ptr, ptr::NonNull};

use crate::{consts, Error};

/// The heap-growth primitive and the heap-bounds queries an [`Allocator`] is built on
///
/// [`Allocator`]: struct.Allocator.html
///
/// # Safety
///
/// Implementors must guarantee that
///
/// - `base` never changes during the lifetime of the source,
/// - the bytes `base .. base + len` are valid for reads and writes and are not accessed by
///   anything but the owner of the source,
/// - `sbrk` only ever appends memory at the high end of the region, i.e. on success it returns
///   `base + len` (as observed before the call) and `len` grows by exactly `incr`.
pub unsafe trait MemorySource {
    /// Lowest address of the region
    fn base(&self) -> NonNull<u8>;

    /// Current size of the region in bytes
    fn len(&self) -> usize;

    /// Whether nothing has been handed out yet
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extends the region by `incr` bytes and returns a pointer to the first new byte
    fn sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, Error>;

    /// Address of the first byte of the region
    fn heap_lo(&self) -> *mut u8 {
        self.base().as_ptr()
    }

    /// Address of the last valid byte of the region
    fn heap_hi(&self) -> *mut u8 {
        self.base()
            .as_ptr()
            .wrapping_add(self.len())
            .wrapping_sub(1)
    }
}

/// Bounds checked word access to the memory of a source
///
/// Every metadata read or write in the crate goes through here; an out of range or misaligned
/// offset is a bug in the allocator (or a bogus pointer handed in by the caller) and panics
/// instead of scribbling over memory.
pub(crate) struct Arena<S> {
    source: S,
}

impl<S> Arena<S>
where
    S: MemorySource,
{
    pub fn new(source: S) -> Result<Self, Error> {
        let base = source.base().as_ptr() as usize;
        if base % consts::ALIGN_SIZE != 0 {
            return Err(Error::UnalignedBase { base });
        }

        Ok(Arena { source })
    }

    /* Region */
    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Grows the region by `incr` bytes, returning the offset of the first new byte
    pub fn grow(&mut self, incr: usize) -> Result<usize, Error> {
        let old = self.len();

        match old.checked_add(incr) {
            Some(new) if new <= consts::MAX_HEAP_SIZE => {}
            _ => return Err(Error::OutOfMemory { requested: incr }),
        }

        let start = self.source.sbrk(incr)?;
        if start.as_ptr() as usize != self.source.base().as_ptr() as usize + old
            || self.len() != old + incr
        {
            return Err(Error::NonContiguous);
        }

        Ok(old)
    }

    /* Pointers */
    pub fn ptr(&self, offset: usize) -> NonNull<u8> {
        self.check(offset, 0, 1);

        unsafe { NonNull::new_unchecked(self.source.base().as_ptr().add(offset)) }
    }

    /// Converts a payload pointer back into an offset
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.source.base().as_ptr() as usize)?;

        if offset >= consts::FIRST_BLOCK
            && offset < self.len()
            && offset % consts::ALIGN_SIZE == 0
        {
            Some(offset)
        } else {
            None
        }
    }

    /* Words */
    pub fn word(&self, offset: usize) -> u32 {
        self.check(offset, consts::WSIZE, consts::WSIZE);

        unsafe { ptr::read(self.source.base().as_ptr().add(offset) as *const u32) }
    }

    /// Like `word` but returns `None` instead of panicking
    pub fn try_word(&self, offset: usize) -> Option<u32> {
        if self.in_bounds(offset, consts::WSIZE, consts::WSIZE) {
            Some(self.word(offset))
        } else {
            None
        }
    }

    pub fn set_word(&mut self, offset: usize, value: u32) {
        self.check(offset, consts::WSIZE, consts::WSIZE);

        unsafe { ptr::write(self.source.base().as_ptr().add(offset) as *mut u32, value) }
    }

    pub fn slot(&self, offset: usize) -> u64 {
        self.check(offset, consts::BUCKET_SLOT_SIZE, consts::BUCKET_SLOT_SIZE);

        unsafe { ptr::read(self.source.base().as_ptr().add(offset) as *const u64) }
    }

    pub fn set_slot(&mut self, offset: usize, value: u64) {
        self.check(offset, consts::BUCKET_SLOT_SIZE, consts::BUCKET_SLOT_SIZE);

        unsafe { ptr::write(self.source.base().as_ptr().add(offset) as *mut u64, value) }
    }

    /* Payload bytes */
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        self.check(offset, len, 1);

        unsafe { ptr::write_bytes(self.source.base().as_ptr().add(offset), byte, len) }
    }

    /// Copies `len` bytes between two distinct blocks
    pub fn copy(&mut self, src: usize, dst: usize, len: usize) {
        self.check(src, len, 1);
        self.check(dst, len, 1);
        debug_assert!(src + len <= dst || dst + len <= src);

        unsafe {
            let base = self.source.base().as_ptr();
            ptr::copy_nonoverlapping(base.add(src), base.add(dst), len)
        }
    }

    /* Bounds */
    fn in_bounds(&self, offset: usize, len: usize, align: usize) -> bool {
        offset % align == 0
            && offset
                .checked_add(len)
                .map(|end| end <= self.len())
                .unwrap_or(false)
    }

    fn check(&self, offset: usize, len: usize, align: usize) {
        assert!(
            self.in_bounds(offset, len, align),
            "heap access out of bounds: offset {:#x}, {} bytes, heap size {:#x}",
            offset,
            len,
            self.len()
        );
    }
}

/// Converts a heap offset into the 32-bit form stored in links and bucket slots
pub(crate) fn narrow(offset: usize) -> u32 {
    u32::try_from(offset).unwrap_or_else(|_| unreachable!("heap offsets fit in 32 bits"))
}
