use core::{fmt, num::NonZeroU32};

use crate::{
    consts,
    heap::{self, Arena, MemorySource},
    Offset,
};

/// Decoded contents of a header (or footer) word
///
/// A block's size, whether it is allocated, and whether the block right before it in address
/// order is allocated. The last flag lets `free` find out if the previous block can be merged
/// without reading a footer that allocated blocks don't have.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    size: u32,
    prev_alloc: bool,
    alloc: bool,
}

impl Header {
    /// Size of the encoded header in bytes
    pub const SIZE: usize = consts::WSIZE;

    const ALLOC_BIT: u32 = 1 << 0;
    const PREV_ALLOC_BIT: u32 = 1 << 1;
    const FLAGS: u32 = (consts::ALIGN_SIZE - 1) as u32;

    /* Constructors */
    /// Builds a header; `size` must be a multiple of `ALIGN_SIZE`
    pub fn new(size: usize, prev_alloc: bool, alloc: bool) -> Self {
        debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
        debug_assert!(size <= consts::MAX_BLOCK_SIZE);

        Header {
            size: heap::narrow(size),
            prev_alloc,
            alloc,
        }
    }

    /// The size-zero, always allocated header that terminates the heap
    pub fn epilogue(prev_alloc: bool) -> Self {
        Header::new(0, prev_alloc, true)
    }

    /// Decodes a header word
    pub fn unpack(word: u32) -> Self {
        Header {
            size: word & !Self::FLAGS,
            prev_alloc: word & Self::PREV_ALLOC_BIT != 0,
            alloc: word & Self::ALLOC_BIT != 0,
        }
    }

    /// Encodes this header into a word
    pub fn pack(self) -> u32 {
        let mut word = self.size;
        if self.prev_alloc {
            word |= Self::PREV_ALLOC_BIT;
        }
        if self.alloc {
            word |= Self::ALLOC_BIT;
        }
        word
    }

    /* Getters */
    /// Block size in bytes, overhead included
    pub fn size(self) -> usize {
        self.size as usize
    }

    /// Whether the block is allocated
    pub fn is_alloc(self) -> bool {
        self.alloc
    }

    /// Whether the previous block in address order is allocated
    pub fn is_prev_alloc(self) -> bool {
        self.prev_alloc
    }

    /* Modifiers */
    /// Same header with a different allocated flag
    pub fn with_alloc(self, alloc: bool) -> Self {
        Header { alloc, ..self }
    }

    /// Same header with a different previous-allocated flag
    pub fn with_prev_alloc(self, prev_alloc: bool) -> Self {
        Header { prev_alloc, ..self }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size)
            .field("prev_alloc", &self.prev_alloc)
            .field("alloc", &self.alloc)
            .finish()
    }
}

#[cfg(feature = "ufmt")]
impl ufmt::uDebug for Header {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_struct("Header")?
            .field("size", &self.size)?
            .field("prev_alloc", &self.prev_alloc)?
            .field("alloc", &self.alloc)?
            .finish()
    }
}

/// A block, identified by the offset of its payload from the heap base
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block {
    bp: Offset,
}

impl Block {
    /* Constructors */
    pub fn from_offset(bp: Offset) -> Self {
        debug_assert_eq!(bp.get() as usize % consts::ALIGN_SIZE, 0);

        Block { bp }
    }

    pub fn new_unchecked(bp: usize) -> Self {
        Block::from_offset(
            NonZeroU32::new(heap::narrow(bp)).unwrap_or_else(|| unreachable!("offset 0 is the heap base")),
        )
    }

    /* Getters */
    pub fn offset(self) -> Offset {
        self.bp
    }

    pub fn addr(self) -> usize {
        self.bp.get() as usize
    }

    pub fn header_offset(self) -> usize {
        self.addr() - Header::SIZE
    }

    pub fn footer_offset(self, size: usize) -> usize {
        self.addr() + size - consts::DSIZE
    }

    pub fn header<S>(self, arena: &Arena<S>) -> Header
    where
        S: MemorySource,
    {
        Header::unpack(arena.word(self.header_offset()))
    }

    pub fn footer<S>(self, arena: &Arena<S>) -> Header
    where
        S: MemorySource,
    {
        let size = self.header(arena).size();
        Header::unpack(arena.word(self.footer_offset(size)))
    }

    pub fn size<S>(self, arena: &Arena<S>) -> usize
    where
        S: MemorySource,
    {
        self.header(arena).size()
    }

    /* Setters */
    pub fn set_header<S>(self, arena: &mut Arena<S>, header: Header)
    where
        S: MemorySource,
    {
        arena.set_word(self.header_offset(), header.pack());
    }

    /// Writes the boundary tags (header and footer) of a free block
    pub fn set_tags<S>(self, arena: &mut Arena<S>, header: Header)
    where
        S: MemorySource,
    {
        debug_assert!(!header.is_alloc());

        arena.set_word(self.header_offset(), header.pack());
        arena.set_word(self.footer_offset(header.size()), header.pack());
    }

    /// Records whether the previous block is allocated; free blocks get their footer updated too
    pub fn set_prev_alloc<S>(self, arena: &mut Arena<S>, prev_alloc: bool)
    where
        S: MemorySource,
    {
        let header = self.header(arena).with_prev_alloc(prev_alloc);

        if header.is_alloc() || header.size() == 0 {
            self.set_header(arena, header);
        } else {
            self.set_tags(arena, header);
        }
    }

    /* Neighbors */
    pub fn next<S>(self, arena: &Arena<S>) -> Block
    where
        S: MemorySource,
    {
        let size = self.size(arena);
        debug_assert_ne!(size, 0, "the epilogue has no successor");

        Block::new_unchecked(self.addr() + size)
    }

    // NOTE only meaningful when the previous block is free; allocated blocks have no footer
    pub fn prev<S>(self, arena: &Arena<S>) -> Block
    where
        S: MemorySource,
    {
        let footer = Header::unpack(arena.word(self.addr() - consts::DSIZE));

        Block::new_unchecked(self.addr() - footer.size())
    }

    /// Splits a free block in two, returning the free remainder
    ///
    /// The first block keeps `n` bytes and becomes allocated; its previous-allocated flag is
    /// left as it was.
    pub fn split<S>(self, arena: &mut Arena<S>, n: usize) -> Block
    where
        S: MemorySource,
    {
        let header = self.header(arena);
        let total = header.size();

        debug_assert_eq!(n % consts::ALIGN_SIZE, 0);
        debug_assert!(total >= n + consts::MIN_BLOCK_SIZE);

        self.set_header(arena, Header::new(n, header.is_prev_alloc(), true));

        let rest = Block::new_unchecked(self.addr() + n);
        rest.set_tags(arena, Header::new(total - n, true, false));

        rest
    }
}
