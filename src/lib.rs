//! A segregated free-list allocator with boundary tags, managing a single growable heap region
//!
//! # Features
//!
//! - 4 bytes of metadata (overhead) per allocated block; free blocks carry a footer as well
//!
//! - 16 segregated free lists searched first-fit, so allocation stays fast at any heap occupancy
//!
//! - Constant time coalescing of adjacent free blocks
//!
//! - A consistency checker that validates every layout invariant and reports findings as data
//!
//! - Pluggable heap growth: anything that implements [`MemorySource`] (an `sbrk`-like primitive)
//!
//! # Example
//!
//! ```
//! use segfit::{Allocator, MemLib};
//!
//! let mut heap = Allocator::new(MemLib::new()?)?;
//!
//! let p = heap.malloc(100)?.expect("non-zero request");
//! unsafe {
//!     p.as_ptr().write_bytes(0xAA, 100);
//!     heap.free(Some(p));
//! }
//!
//! assert!(heap.check().is_consistent());
//! # Ok::<(), segfit::Error>(())
//! ```
//!
//! To use it as the global allocator wrap it in [`Locked`], which serializes every call with a
//! single lock and builds the allocator on first use.
//!
//! # Heap layout
//!
//! ``` text
//! 0        128      132        136        140
//! | bucket | pad    | prologue | prologue | block ... | block ... | epilogue |
//! | heads  | (0)    | header   | footer   |           |           | header   |
//! ```
//!
//! The first 128 bytes hold the heads of the 16 free lists. Every block starts with a 4-byte
//! header holding its size and two flags: whether the block is allocated and whether the block
//! right before it is. Free blocks repeat the header in their last word (the footer) and store
//! the `prev` / `next` free-list links in the first 8 bytes of their payload. Links and list
//! heads are 32-bit offsets from the heap base; offset 0 means "no block".
//!
//! The prologue (an allocated 8-byte block) and the epilogue (a size-zero allocated header)
//! bound the heap so that neighbor lookups never need a special case.
//!
//! # Cargo features
//!
//! - `check-heap`: run [`Allocator::check`] after every public operation and log each finding
//!   at the `error` level. Slow; meant for development.
//! - `ufmt`: `ufmt::uDebug` implementations for the diagnostic types.
//!
//! # Limitations
//!
//! - Payloads are 8-byte aligned; there is no support for bigger alignments.
//! - Offsets are 32 bits wide so the heap can't grow past 4 GiB.
//! - The heap never shrinks, and `realloc` always moves the allocation.
//! - The allocator itself is not thread safe; see [`Locked`].

#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

use core::{cmp, fmt, num::NonZeroU32, ptr::NonNull};

pub use crate::{
    block::Header,
    check::{HeapReport, Inconsistency},
    consts::{ALIGN_SIZE, BUCKETS, CHUNK_SIZE, MIN_BLOCK_SIZE},
    error::Error,
    global::Locked,
    heap::MemorySource,
    memlib::MemLib,
    util::{bucket_for, Bucket},
};

#[cfg(unix)]
pub use crate::sbrk::Sbrk;

use crate::{
    block::Block,
    free_block::{FreeBlock, FreeListIter},
    heap::Arena,
};

mod block;
mod check;
mod consts;
mod error;
mod free_block;
mod global;
mod heap;
mod memlib;
#[cfg(unix)]
mod sbrk;
#[cfg(test)]
mod tests;
mod util;

/// Payload offset of a block from the heap base
type Offset = NonZeroU32;

/// The segregated free-list allocator
///
/// All state (the bucket table, the block headers, the free-list links) lives inside the memory
/// managed by the source `S`; this struct only owns the source.
pub struct Allocator<S>
where
    S: MemorySource,
{
    arena: Arena<S>,
}

/// A block as seen by an address-order walk of the heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block's payload from the heap base
    pub offset: usize,
    /// The block's header
    pub header: Header,
}

impl<S> Allocator<S>
where
    S: MemorySource,
{
    /* Constructors */
    /// Lays out an empty heap at the start of `source` and grows it by one chunk
    ///
    /// `source` must be empty: the bucket table is placed at its base.
    pub fn new(source: S) -> Result<Self, Error> {
        let mut arena = Arena::new(source)?;

        if arena.grow(consts::PREFIX_SIZE)? != 0 {
            return Err(Error::NonContiguous);
        }

        for bucket in Bucket::all() {
            arena.set_slot(bucket.slot(), 0);
        }
        arena.set_word(consts::PADDING, 0);

        let prologue = Block::new_unchecked(consts::PROLOGUE);
        let header = Header::new(consts::PROLOGUE_SIZE, true, true);
        prologue.set_header(&mut arena, header);
        arena.set_word(prologue.footer_offset(consts::PROLOGUE_SIZE), header.pack());

        Block::new_unchecked(consts::FIRST_BLOCK).set_header(&mut arena, Header::epilogue(true));

        let mut allocator = Allocator { arena };
        allocator.extend_heap(consts::CHUNK_SIZE)?;

        log::debug!(
            "heap initialized at {:p}, {} bytes",
            allocator.arena.source().heap_lo(),
            allocator.heap_size()
        );
        allocator.audit("init");

        Ok(allocator)
    }

    /* Public API */
    /// Allocates a block with at least `size` bytes of payload
    ///
    /// Returns `Ok(None)` when `size` is zero. The payload is `ALIGN_SIZE`-aligned and not
    /// initialized.
    pub fn malloc(&mut self, size: usize) -> Result<Option<NonNull<u8>>, Error> {
        if size == 0 {
            log::trace!("malloc(0) -> none");
            return Ok(None);
        }

        let asize = match util::adjust_size(size) {
            Some(asize) => asize,
            None => {
                log::warn!("malloc({}): request too large", size);
                return Err(Error::OutOfMemory { requested: size });
            }
        };

        let fb = match self.find_fit(asize) {
            Some(fb) => fb,
            // no fit; get more memory
            None => self
                .extend_heap(cmp::max(asize, consts::CHUNK_SIZE))
                .map_err(|e| {
                    log::warn!("malloc({}): {}", size, e);
                    e
                })?,
        };

        self.unlink(fb);
        let block = self.place(fb, asize);
        let ptr = self.arena.ptr(block.addr());

        log::trace!("malloc({}) -> {:p} (block of {} bytes)", size, ptr, block.size(&self.arena));
        self.audit("malloc");

        Ok(Some(ptr))
    }

    /// Returns the block referenced by `ptr` to the heap; `None` is a no-op
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since. Pointers outside the
    /// heap are caught (this panics); pointers into the heap that aren't live allocations
    /// corrupt the heap.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => {
                log::trace!("free(null)");
                return;
            }
        };

        let block = self.block_of(ptr);
        let header = block.header(&self.arena);
        debug_assert!(header.is_alloc(), "double free of {:p}", ptr);

        block.set_tags(
            &mut self.arena,
            Header::new(header.size(), header.is_prev_alloc(), false),
        );
        self.coalesce(block);

        log::trace!("free({:p}) ({} bytes)", ptr, header.size());
        self.audit("free");
    }

    /// Resizes the allocation referenced by `ptr` to `size` bytes
    ///
    /// - `size == 0` frees `ptr` and returns `Ok(None)`
    /// - `ptr == None` is the same as `malloc(size)`
    /// - otherwise a new block is allocated, `min(size, old payload)` bytes are copied over and
    ///   the old block is freed. If the new allocation fails the old block is left untouched.
    ///
    /// The allocation is always moved; growing or shrinking in place is not attempted.
    ///
    /// # Safety
    ///
    /// Same as [`free`](#method.free).
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, Error> {
        if size == 0 {
            self.free(ptr);
            return Ok(None);
        }

        let old = match ptr {
            Some(old) => old,
            None => return self.malloc(size),
        };

        // the old block must be valid before anything is allocated
        let old_block = self.block_of(old);

        let new = match self.malloc(size)? {
            Some(new) => new,
            None => return Ok(None),
        };
        let new_block = self.block_of(new);

        let old_payload = old_block.size(&self.arena) - Header::SIZE;
        self.arena
            .copy(old_block.addr(), new_block.addr(), cmp::min(size, old_payload));

        self.free(Some(old));

        log::trace!("realloc({:p}, {}) -> {:p}", old, size, new);

        Ok(Some(new))
    }

    /// Allocates zeroed memory for `count` elements of `size` bytes
    ///
    /// Returns `Err(Error::Overflow)` when `count * size` overflows and `Ok(None)` when it's
    /// zero.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<Option<NonNull<u8>>, Error> {
        let bytes = count
            .checked_mul(size)
            .ok_or(Error::Overflow { count, size })?;

        let ptr = self.malloc(bytes)?;
        if let Some(ptr) = ptr {
            let block = self.block_of(ptr);
            self.arena.fill(block.addr(), bytes, 0);
        }

        Ok(ptr)
    }

    /// Number of payload bytes usable through `ptr`; at least what was requested
    ///
    /// Panics if `ptr` doesn't point into the heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.block_of(ptr).size(&self.arena) - Header::SIZE
    }

    /// Lowest and highest valid addresses of the heap
    pub fn heap_bounds(&self) -> (*const u8, *const u8) {
        let source = self.arena.source();
        (source.heap_lo() as *const u8, source.heap_hi() as *const u8)
    }

    /// Current size of the heap in bytes, bucket table and sentinels included
    pub fn heap_size(&self) -> usize {
        self.arena.len()
    }

    /// The memory source backing this allocator
    pub fn source(&self) -> &S {
        self.arena.source()
    }

    /// Gives the memory source back; every outstanding allocation becomes dangling
    pub fn into_source(self) -> S {
        self.arena.into_source()
    }

    /// Every block in address order, from the first block after the prologue up to (excluding)
    /// the epilogue
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut next = Some(Block::new_unchecked(consts::FIRST_BLOCK));

        core::iter::from_fn(move || {
            let block = next?;
            let header = block.header(&self.arena);

            if header.size() == 0 {
                // epilogue
                next = None;
                return None;
            }

            next = Some(block.next(&self.arena));
            Some(BlockInfo {
                offset: block.addr(),
                header,
            })
        })
    }

    /// Every free block, grouped by bucket, in list order
    pub fn free_blocks(&self) -> impl Iterator<Item = (Bucket, BlockInfo)> + '_ {
        Bucket::all().flat_map(move |bucket| {
            self.free_list(bucket).map(move |fb| {
                (
                    bucket,
                    BlockInfo {
                        offset: fb.addr(),
                        header: fb.header(&self.arena),
                    },
                )
            })
        })
    }

    /* Private API */
    /// Grows the heap by (at least) `bytes` and returns the new free block, merged with the
    /// previous block if that one was free
    fn extend_heap(&mut self, bytes: usize) -> Result<FreeBlock, Error> {
        let size = util::round_up(bytes, consts::ALIGN_SIZE)
            .ok_or(Error::OutOfMemory { requested: bytes })?;

        let start = self.arena.grow(size)?;

        // the old epilogue header becomes the header of the new block
        let block = Block::new_unchecked(start);
        let prev_alloc = block.header(&self.arena).is_prev_alloc();
        block.set_tags(&mut self.arena, Header::new(size, prev_alloc, false));
        block
            .next(&self.arena)
            .set_header(&mut self.arena, Header::epilogue(false));

        log::debug!("heap extended by {} bytes to {} bytes", size, self.arena.len());

        Ok(self.coalesce(block))
    }

    /// First block, searching upwards from the bucket of `asize`, that can hold `asize` bytes
    fn find_fit(&self, asize: usize) -> Option<FreeBlock> {
        util::bucket_for(asize)
            .and_larger()
            .flat_map(move |bucket| self.free_list(bucket))
            .find(|fb| fb.size(&self.arena) >= asize)
    }

    /// Turns the (unlinked) free block `fb` into an allocated block of `asize` bytes, splitting
    /// off the excess if it can make a block of its own
    fn place(&mut self, fb: FreeBlock, asize: usize) -> Block {
        let block = fb.into_block();
        let csize = block.size(&self.arena);

        if csize - asize >= consts::MIN_BLOCK_SIZE {
            let rest = block.split(&mut self.arena, asize);
            self.insert(FreeBlock::new_unchecked(rest));
        } else {
            let header = block.header(&self.arena).with_alloc(true);
            block.set_header(&mut self.arena, header);
            block.next(&self.arena).set_prev_alloc(&mut self.arena, true);
        }

        block
    }

    /// Merges the (unlinked) free `block` with its free neighbors and puts the result in the
    /// free list matching its final size
    fn coalesce(&mut self, block: Block) -> FreeBlock {
        let header = block.header(&self.arena);
        let next = block.next(&self.arena);
        let next_header = next.header(&self.arena);

        let mut size = header.size();

        let merged = match (header.is_prev_alloc(), next_header.is_alloc()) {
            (true, true) => {
                next.set_prev_alloc(&mut self.arena, false);
                block
            }

            (true, false) => {
                self.unlink(FreeBlock::new_unchecked(next));

                size += next_header.size();
                block.set_tags(&mut self.arena, Header::new(size, true, false));
                block
            }

            (false, true) => {
                let prev = block.prev(&self.arena);
                let prev_header = prev.header(&self.arena);
                self.unlink(FreeBlock::new_unchecked(prev));

                size += prev_header.size();
                next.set_prev_alloc(&mut self.arena, false);
                prev.set_tags(
                    &mut self.arena,
                    Header::new(size, prev_header.is_prev_alloc(), false),
                );
                prev
            }

            (false, false) => {
                let prev = block.prev(&self.arena);
                let prev_header = prev.header(&self.arena);
                self.unlink(FreeBlock::new_unchecked(prev));
                self.unlink(FreeBlock::new_unchecked(next));

                size += prev_header.size() + next_header.size();
                prev.set_tags(
                    &mut self.arena,
                    Header::new(size, prev_header.is_prev_alloc(), false),
                );
                prev
            }
        };

        let fb = FreeBlock::new_unchecked(merged);
        self.insert(fb);
        fb
    }

    /// Pushes `fb` at the head of the free list of its size class
    fn insert(&mut self, fb: FreeBlock) {
        let bucket = util::bucket_for(fb.size(&self.arena));
        let head = self.free_list_head(bucket);

        fb.set_prev_free(&mut self.arena, None);
        fb.set_next_free(&mut self.arena, head);
        if let Some(head) = head {
            head.set_prev_free(&mut self.arena, Some(fb));
        }

        self.set_free_list_head(bucket, Some(fb));
    }

    /// Removes `fb` from its free list
    ///
    /// The list is found from the size in the header, so the header must not have been resized
    /// since `fb` was inserted.
    fn unlink(&mut self, fb: FreeBlock) {
        debug_assert_eq!(fb.footer(&self.arena), fb.header(&self.arena));

        let next = fb.next_free(&self.arena);
        let prev = fb.prev_free(&self.arena);

        if let Some(prev) = prev {
            prev.set_next_free(&mut self.arena, next);
        } else {
            // this is the head of the list
            let bucket = util::bucket_for(fb.size(&self.arena));
            debug_assert_eq!(self.free_list_head(bucket), Some(fb));

            self.set_free_list_head(bucket, next);
        }

        if let Some(next) = next {
            next.set_prev_free(&mut self.arena, prev);
        }
    }

    fn block_of(&self, ptr: NonNull<u8>) -> Block {
        match self.arena.offset_of(ptr) {
            Some(offset) => Block::new_unchecked(offset),
            None => panic!("{:p} does not point to a block of this heap", ptr),
        }
    }

    /* Getters */
    fn free_list_head(&self, bucket: Bucket) -> Option<FreeBlock> {
        let slot = self.arena.slot(bucket.slot());

        u32::try_from(slot)
            .ok()
            .and_then(NonZeroU32::new)
            .map(FreeBlock::from_offset)
    }

    fn set_free_list_head(&mut self, bucket: Bucket, head: Option<FreeBlock>) {
        self.arena
            .set_slot(bucket.slot(), u64::from(free_block::encode(head)));
    }

    fn free_list(&self, bucket: Bucket) -> FreeListIter<'_, S> {
        FreeListIter {
            arena: &self.arena,
            next: self.free_list_head(bucket),
        }
    }

    #[cfg(feature = "check-heap")]
    fn audit(&self, op: &str) {
        let report = self.check();
        for issue in &report.issues {
            log::error!("{}: {}", op, issue);
        }
    }

    #[cfg(not(feature = "check-heap"))]
    #[inline(always)]
    fn audit(&self, _op: &str) {}
}

struct FreeLists<'a, S>(&'a Allocator<S>)
where
    S: MemorySource;

impl<S> fmt::Debug for FreeLists<'_, S>
where
    S: MemorySource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for bucket in Bucket::all() {
            if self.0.free_list_head(bucket).is_some() {
                map.entry(&bucket, &List(self.0, bucket));
            }
        }
        map.finish()
    }
}

struct List<'a, S>(&'a Allocator<S>, Bucket)
where
    S: MemorySource;

impl<S> fmt::Debug for List<'_, S>
where
    S: MemorySource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = &self.0.arena;

        f.debug_list()
            .entries(
                self.0
                    .free_list(self.1)
                    .map(|fb| (fb.addr(), fb.size(arena))),
            )
            .finish()
    }
}

impl<S> fmt::Debug for Allocator<S>
where
    S: MemorySource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("heap_lo", &self.arena.source().heap_lo())
            .field("heap_size", &self.heap_size())
            .field("free_lists", &FreeLists(self))
            .finish()
    }
}
