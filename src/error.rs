use thiserror::Error;

use crate::consts;

/// Failures surfaced by the allocator and by memory sources
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The memory source refused to grow the heap, or the request is too large to be described
    /// by a block header
    #[error("out of memory: cannot provide {requested} more bytes")]
    OutOfMemory {
        /// Number of bytes that could not be provided
        requested: usize,
    },

    /// `calloc` was asked for more than `usize::MAX` bytes
    #[error("allocation of {count} elements of {size} bytes overflows")]
    Overflow {
        /// Element count
        count: usize,
        /// Element size
        size: usize,
    },

    /// The memory source extended the heap somewhere other than at the previous break
    #[error("memory source returned non-contiguous memory")]
    NonContiguous,

    /// The memory source's base address can't hold aligned payloads
    #[error("heap base {base:#x} is not {}-byte aligned", consts::ALIGN_SIZE)]
    UnalignedBase {
        /// Base address reported by the source
        base: usize,
    },
}
