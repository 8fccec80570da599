/// Size of a header, footer or free-list link word
pub const WSIZE: usize = 4;

/// Double word size
pub const DSIZE: usize = 2 * WSIZE;

/// All block sizes are multiple of this number; this number is also the alignment of every
/// payload handed out by the allocator
pub const ALIGN_SIZE: usize = DSIZE;

/// Smallest block that can hold a header, the two free-list links and a footer
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// The heap grows by at least this many bytes whenever no free block fits a request
pub const CHUNK_SIZE: usize = 1 << 13;

/// Number of segregated free lists
pub const BUCKETS: usize = 16;

/// Inclusive upper bound of every bucket but the last one, which is unbounded
pub const BUCKET_LIMITS: [usize; BUCKETS - 1] = [
    16, 32, 64, 96, 128, 256, 384, 512, 768, 1024, 2048, 3072, 4096, 8192, 16384,
];

/// Each bucket head occupies one slot of this size at the base of the heap
pub const BUCKET_SLOT_SIZE: usize = 8;

pub const BUCKET_TABLE_SIZE: usize = BUCKETS * BUCKET_SLOT_SIZE;

// [bucket table] [padding] [prologue header] [prologue footer] [epilogue header]
pub const PADDING: usize = BUCKET_TABLE_SIZE;
pub const PROLOGUE: usize = BUCKET_TABLE_SIZE + DSIZE;
pub const PROLOGUE_SIZE: usize = DSIZE;

/// Payload offset of the first regular block
pub const FIRST_BLOCK: usize = PROLOGUE + DSIZE;

/// Bytes reserved by `Allocator::new` before the first heap extension
pub const PREFIX_SIZE: usize = BUCKET_TABLE_SIZE + 2 * DSIZE;

/// Offsets are stored in 32 bits so the heap can never get past this size
pub const MAX_HEAP_SIZE: usize = u32::MAX as usize & !(ALIGN_SIZE - 1);

/// The largest block the header can describe
pub const MAX_BLOCK_SIZE: usize = MAX_HEAP_SIZE - PREFIX_SIZE;

// NOTE the prefix must keep the first payload aligned
#[allow(dead_code)]
const ASSERT0: [(); 0 - !(FIRST_BLOCK % ALIGN_SIZE == 0) as usize] = [];

// NOTE the first bucket holds exactly the minimum sized blocks
#[allow(dead_code)]
const ASSERT1: [(); 0 - !(BUCKET_LIMITS[0] == MIN_BLOCK_SIZE) as usize] = [];
