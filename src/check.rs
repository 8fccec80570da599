//! Heap consistency checker
//!
//! Walks the heap twice, once block by block in address order and once list by list through
//! the bucket table, and reports everything that breaks a layout invariant. Nothing here panics
//! on a corrupted heap: reads that would leave the heap end the walk with an `OutOfBounds`
//! finding instead.

use thiserror::Error;

use crate::{
    block::Header,
    consts,
    util::{self, Bucket},
    Allocator, MemorySource,
};

/// A broken heap invariant
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Inconsistency {
    /// The word between the bucket table and the prologue is not zero
    #[error("padding word is {value:#x}, expected 0")]
    Padding {
        /// The word found
        value: u32,
    },

    /// The prologue is not an allocated 8-byte block with matching footer
    #[error("bad prologue: header {header:?}, footer {footer:?}")]
    Prologue {
        /// Prologue header
        header: Header,
        /// Prologue footer
        footer: Header,
    },

    /// The last word of the heap is not a size-zero allocated header
    #[error("bad epilogue {header:?}")]
    Epilogue {
        /// What was found at the end of the heap
        header: Header,
    },

    /// The address-order walk met a size-zero header before the end of the heap
    #[error("block at {offset:#x} has size 0 before the end of the heap")]
    PrematureEnd {
        /// Payload offset of the block
        offset: usize,
    },

    /// The walk left the heap
    #[error("block at {offset:#x} lies outside the heap")]
    OutOfBounds {
        /// Payload offset of the block
        offset: usize,
    },

    /// A payload is not `ALIGN_SIZE`-aligned
    #[error("block at {offset:#x} is not {}-byte aligned", consts::ALIGN_SIZE)]
    Misaligned {
        /// Payload offset of the block
        offset: usize,
    },

    /// A block size is not a multiple of `ALIGN_SIZE`
    #[error("block at {offset:#x} has size {size}, not a multiple of {}", consts::ALIGN_SIZE)]
    SizeNotAligned {
        /// Payload offset of the block
        offset: usize,
        /// Its size
        size: usize,
    },

    /// A block is smaller than `MIN_BLOCK_SIZE`
    #[error("block at {offset:#x} has size {size} < {}", consts::MIN_BLOCK_SIZE)]
    Undersized {
        /// Payload offset of the block
        offset: usize,
        /// Its size
        size: usize,
    },

    /// A header disagrees with the actual state of the previous block
    #[error("block at {offset:#x} says previous block allocated = {recorded}, it is {actual}")]
    PrevAlloc {
        /// Payload offset of the block (or of the epilogue)
        offset: usize,
        /// Flag stored in the header
        recorded: bool,
        /// Real state of the previous block
        actual: bool,
    },

    /// A free block's footer differs from its header
    #[error("free block at {offset:#x} has header {header:?} but footer {footer:?}")]
    Footer {
        /// Payload offset of the block
        offset: usize,
        /// Its header
        header: Header,
        /// Its footer
        footer: Header,
    },

    /// Two free blocks next to each other escaped coalescing
    #[error("free blocks at {first:#x} and {second:#x} are adjacent")]
    AdjacentFree {
        /// The lower block
        first: usize,
        /// The upper block
        second: usize,
    },

    /// A free-list node points outside the heap
    #[error("{bucket:?} links to {offset:#x}, outside the heap")]
    ListOutOfBounds {
        /// The list
        bucket: Bucket,
        /// The bogus link
        offset: usize,
    },

    /// A free-list node is in the wrong size class
    #[error("block at {offset:#x} of size {size} is in {bucket:?}")]
    WrongBucket {
        /// The list the block was found in
        bucket: Bucket,
        /// Payload offset of the block
        offset: usize,
        /// Its size
        size: usize,
    },

    /// A free-list node is marked allocated
    #[error("allocated block at {offset:#x} is in {bucket:?}")]
    AllocatedInList {
        /// The list
        bucket: Bucket,
        /// Payload offset of the block
        offset: usize,
    },

    /// A node's `prev` link doesn't point to the node before it
    #[error("block at {offset:#x} in {bucket:?} has prev link {found:#x}, expected {expected:#x}")]
    PrevLink {
        /// The list
        bucket: Bucket,
        /// Payload offset of the block
        offset: usize,
        /// Offset of the previous node (0 for the head)
        expected: usize,
        /// The link stored in the block
        found: usize,
    },

    /// Following `next` links never reaches the end of the list
    #[error("{bucket:?} has a cycle")]
    Cycle {
        /// The list
        bucket: Bucket,
    },

    /// The heap walk and the free lists disagree on the number of free blocks
    #[error("{scanned} free blocks in the heap but {listed} in the free lists")]
    FreeCount {
        /// Free blocks met walking the heap
        scanned: usize,
        /// Nodes met walking the free lists
        listed: usize,
    },
}

/// Outcome of [`Allocator::check`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Every violation found, in discovery order
    pub issues: Vec<Inconsistency>,
    /// Blocks between the prologue and the epilogue
    pub blocks: usize,
    /// Free blocks found by the address-order walk
    pub free_by_scan: usize,
    /// Free blocks found by walking every free list
    pub free_by_list: usize,
}

impl HeapReport {
    /// Whether no violation was found
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(feature = "ufmt")]
impl ufmt::uDebug for HeapReport {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_struct("HeapReport")?
            .field("issues", &self.issues.len())?
            .field("blocks", &self.blocks)?
            .field("free_by_scan", &self.free_by_scan)?
            .field("free_by_list", &self.free_by_list)?
            .finish()
    }
}

impl<S> Allocator<S>
where
    S: MemorySource,
{
    /// Validates the whole heap
    ///
    /// Checks the sentinels, then every block (bounds, alignment, size, previous-allocated flag,
    /// footer of free blocks, no two free blocks in a row), then every free list (bounds, size
    /// class, free state, `prev` links, cycles), and finally that both walks count the same
    /// number of free blocks. Runs in time linear in the heap size; findings never affect the
    /// allocator.
    pub fn check(&self) -> HeapReport {
        let mut report = HeapReport::default();

        self.check_sentinels(&mut report);
        self.check_blocks(&mut report);
        self.check_lists(&mut report);

        if report.free_by_scan != report.free_by_list {
            report.issues.push(Inconsistency::FreeCount {
                scanned: report.free_by_scan,
                listed: report.free_by_list,
            });
        }

        report
    }

    fn check_sentinels(&self, report: &mut HeapReport) {
        let arena = &self.arena;

        match arena.try_word(consts::PADDING) {
            Some(0) => {}
            Some(value) => report.issues.push(Inconsistency::Padding { value }),
            None => report.issues.push(Inconsistency::OutOfBounds {
                offset: consts::PADDING,
            }),
        }

        let header = arena.try_word(consts::PROLOGUE - consts::WSIZE).map(Header::unpack);
        let footer = arena.try_word(consts::PROLOGUE).map(Header::unpack);
        if let (Some(header), Some(footer)) = (header, footer) {
            let good = |h: Header| h.size() == consts::PROLOGUE_SIZE && h.is_alloc();
            if !good(header) || !good(footer) {
                report
                    .issues
                    .push(Inconsistency::Prologue { header, footer });
            }
        }

        let end = arena.len().saturating_sub(consts::WSIZE);
        if let Some(header) = arena.try_word(end).map(Header::unpack) {
            if header.size() != 0 || !header.is_alloc() {
                report.issues.push(Inconsistency::Epilogue { header });
            }
        }
    }

    fn check_blocks(&self, report: &mut HeapReport) {
        let arena = &self.arena;
        let len = arena.len();

        let mut bp = consts::FIRST_BLOCK;
        // the prologue
        let mut prev_alloc = true;
        let mut prev_bp = consts::PROLOGUE;

        loop {
            let header = match arena.try_word(bp - consts::WSIZE) {
                Some(word) => Header::unpack(word),
                None => {
                    report.issues.push(Inconsistency::OutOfBounds { offset: bp });
                    break;
                }
            };
            let size = header.size();

            if header.is_prev_alloc() != prev_alloc {
                report.issues.push(Inconsistency::PrevAlloc {
                    offset: bp,
                    recorded: header.is_prev_alloc(),
                    actual: prev_alloc,
                });
            }

            if size == 0 {
                if bp != len {
                    report.issues.push(Inconsistency::PrematureEnd { offset: bp });
                }
                break;
            }

            report.blocks += 1;

            if bp % consts::ALIGN_SIZE != 0 {
                report.issues.push(Inconsistency::Misaligned { offset: bp });
            }
            if size % consts::ALIGN_SIZE != 0 {
                report
                    .issues
                    .push(Inconsistency::SizeNotAligned { offset: bp, size });
            }
            if size < consts::MIN_BLOCK_SIZE {
                report
                    .issues
                    .push(Inconsistency::Undersized { offset: bp, size });
            }

            if !header.is_alloc() {
                report.free_by_scan += 1;

                match arena.try_word(bp + size - consts::DSIZE).map(Header::unpack) {
                    Some(footer) if footer != header => {
                        report.issues.push(Inconsistency::Footer {
                            offset: bp,
                            header,
                            footer,
                        })
                    }
                    Some(_) => {}
                    None => {
                        report.issues.push(Inconsistency::OutOfBounds { offset: bp });
                        break;
                    }
                }

                if !prev_alloc {
                    report.issues.push(Inconsistency::AdjacentFree {
                        first: prev_bp,
                        second: bp,
                    });
                }
            }

            prev_alloc = header.is_alloc();
            prev_bp = bp;
            bp += size;
        }
    }

    fn check_lists(&self, report: &mut HeapReport) {
        let arena = &self.arena;
        let len = arena.len();
        let max_nodes = len / consts::MIN_BLOCK_SIZE;

        for bucket in Bucket::all() {
            let mut prev = 0;
            let mut cur = arena.slot(bucket.slot()) as usize;
            let mut nodes = 0;

            while cur != 0 {
                if nodes > max_nodes {
                    report.issues.push(Inconsistency::Cycle { bucket });
                    break;
                }

                if cur < consts::FIRST_BLOCK || cur >= len || cur % consts::ALIGN_SIZE != 0 {
                    report
                        .issues
                        .push(Inconsistency::ListOutOfBounds { bucket, offset: cur });
                    break;
                }

                let header = Header::unpack(arena.word(cur - consts::WSIZE));
                report.free_by_list += 1;
                nodes += 1;

                if header.is_alloc() {
                    report
                        .issues
                        .push(Inconsistency::AllocatedInList { bucket, offset: cur });
                }
                if util::bucket_for(header.size()) != bucket {
                    report.issues.push(Inconsistency::WrongBucket {
                        bucket,
                        offset: cur,
                        size: header.size(),
                    });
                }

                let (link_prev, link_next) =
                    match (arena.try_word(cur), arena.try_word(cur + consts::WSIZE)) {
                        (Some(p), Some(n)) => (p as usize, n as usize),
                        _ => {
                            report
                                .issues
                                .push(Inconsistency::ListOutOfBounds { bucket, offset: cur });
                            break;
                        }
                    };

                if link_prev != prev {
                    report.issues.push(Inconsistency::PrevLink {
                        bucket,
                        offset: cur,
                        expected: prev,
                        found: link_prev,
                    });
                }

                prev = cur;
                cur = link_next;
            }
        }
    }
}
