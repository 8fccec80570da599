use core::fmt;

#[cfg(feature = "ufmt")]
use ufmt::derive::uDebug;

use crate::{block::Header, consts};

/// One of the segregated free lists
#[cfg_attr(feature = "ufmt", derive(uDebug))]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket(u8);

impl Bucket {
    /// Every bucket, smallest size class first
    pub fn all() -> impl Iterator<Item = Bucket> {
        (0..consts::BUCKETS as u8).map(Bucket)
    }

    /// Bucket by position; `None` if `index >= BUCKETS`
    pub fn from_index(index: usize) -> Option<Bucket> {
        if index < consts::BUCKETS {
            Some(Bucket(index as u8))
        } else {
            None
        }
    }

    /// Position of this bucket in the bucket table
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Largest block size (inclusive) that lands in this bucket; `None` for the last bucket
    pub fn limit(self) -> Option<usize> {
        consts::BUCKET_LIMITS.get(self.index()).copied()
    }

    /// This bucket followed by every bucket holding larger blocks
    pub fn and_larger(self) -> impl Iterator<Item = Bucket> {
        (self.0..consts::BUCKETS as u8).map(Bucket)
    }

    /// Offset of this bucket's head slot from the heap base
    pub(crate) fn slot(self) -> usize {
        self.index() * consts::BUCKET_SLOT_SIZE
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limit() {
            Some(limit) => write!(f, "Bucket({}, ..={})", self.0, limit),
            None => write!(f, "Bucket({}, ..)", self.0),
        }
    }
}

/// Maps a block size to the bucket whose free list holds blocks of that size
pub fn bucket_for(size: usize) -> Bucket {
    let i = consts::BUCKET_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(consts::BUCKETS - 1);

    Bucket(i as u8)
}

/// Block size needed to serve a request of `size` payload bytes
///
/// Returns `None` when the block wouldn't fit in a header.
pub(crate) fn adjust_size(size: usize) -> Option<usize> {
    debug_assert_ne!(size, 0);

    let asize = if size <= consts::DSIZE {
        consts::MIN_BLOCK_SIZE
    } else {
        round_up(size.checked_add(Header::SIZE)?, consts::ALIGN_SIZE)?
    };

    if asize <= consts::MAX_BLOCK_SIZE {
        Some(asize)
    } else {
        None
    }
}

pub fn round_up(x: usize, multiple: usize) -> Option<usize> {
    let rem = x % multiple;
    if rem == 0 {
        Some(x)
    } else {
        x.checked_add(multiple - rem)
    }
}
