use core::{fmt, num::NonZeroU32, ops};

use crate::{
    block::Block,
    consts,
    heap::{Arena, MemorySource},
    Offset,
};

/// A block that is currently linked into one of the segregated free lists
///
/// The first two words of the payload hold the `prev` and `next` links of the list. Links are
/// offsets from the heap base; offset 0 (the base itself, where the bucket table lives) means
/// "no block".
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FreeBlock {
    block: Block,
}

impl FreeBlock {
    const PREV: usize = 0;
    const NEXT: usize = consts::WSIZE;

    /* Constructors */
    pub fn new_unchecked(block: Block) -> Self {
        FreeBlock { block }
    }

    pub fn from_offset(offset: Offset) -> Self {
        FreeBlock::new_unchecked(Block::from_offset(offset))
    }

    /* Links */
    pub fn prev_free<S>(self, arena: &Arena<S>) -> Option<FreeBlock>
    where
        S: MemorySource,
    {
        self.link(arena, Self::PREV)
    }

    pub fn next_free<S>(self, arena: &Arena<S>) -> Option<FreeBlock>
    where
        S: MemorySource,
    {
        self.link(arena, Self::NEXT)
    }

    pub fn set_prev_free<S>(self, arena: &mut Arena<S>, prev: Option<FreeBlock>)
    where
        S: MemorySource,
    {
        self.set_link(arena, Self::PREV, prev);
    }

    pub fn set_next_free<S>(self, arena: &mut Arena<S>, next: Option<FreeBlock>)
    where
        S: MemorySource,
    {
        self.set_link(arena, Self::NEXT, next);
    }

    fn link<S>(self, arena: &Arena<S>, field: usize) -> Option<FreeBlock>
    where
        S: MemorySource,
    {
        NonZeroU32::new(arena.word(self.addr() + field)).map(FreeBlock::from_offset)
    }

    fn set_link<S>(self, arena: &mut Arena<S>, field: usize, link: Option<FreeBlock>)
    where
        S: MemorySource,
    {
        arena.set_word(self.addr() + field, encode(link));
    }

    pub fn into_block(self) -> Block {
        self.block
    }
}

/// Encodes an optional link the way it's stored in the heap
pub(crate) fn encode(link: Option<FreeBlock>) -> u32 {
    link.map(|fb| fb.offset().get()).unwrap_or(0)
}

impl fmt::Debug for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FreeBlock").field(&self.addr()).finish()
    }
}

impl ops::Deref for FreeBlock {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.block
    }
}

/// Walks a free list from its head, in insertion (LIFO) order
pub(crate) struct FreeListIter<'a, S> {
    pub(crate) arena: &'a Arena<S>,
    pub(crate) next: Option<FreeBlock>,
}

impl<'a, S> Iterator for FreeListIter<'a, S>
where
    S: MemorySource,
{
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let fb = self.next?;
        self.next = fb.next_free(self.arena);
        Some(fb)
    }
}
