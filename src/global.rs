use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use parking_lot::Mutex;

use crate::{consts, Allocator, Error, MemorySource};

/// An [`Allocator`] behind a lock, usable as the `#[global_allocator]`
///
/// The heap is built on first use from the memory source returned by `init`; every call then
/// takes the same (coarse) lock. `init` runs with the lock held, so it must not allocate through
/// this allocator: [`MemLib`] reserves its memory from the system allocator and [`Sbrk`] doesn't
/// allocate at all. The same goes for any `log` backend installed while this is the global
/// allocator.
///
/// Requests aligned to more than `ALIGN_SIZE` bytes can't be served and return null.
///
/// [`MemLib`]: struct.MemLib.html
/// [`Sbrk`]: struct.Sbrk.html
///
/// ``` no_run
/// use segfit::{Locked, Sbrk};
///
/// #[global_allocator]
/// static A: Locked<Sbrk> = Locked::new(Sbrk::new);
///
/// fn main() {
///     let v = vec![1u64; 1000];
///     assert_eq!(v.iter().sum::<u64>(), 1000);
/// }
/// ```
pub struct Locked<S>
where
    S: MemorySource,
{
    heap: Mutex<Option<Allocator<S>>>,
    init: fn() -> Result<S, Error>,
}

impl<S> Locked<S>
where
    S: MemorySource,
{
    /// A lock around a not yet initialized heap
    pub const fn new(init: fn() -> Result<S, Error>) -> Self {
        Locked {
            heap: parking_lot::const_mutex(None),
            init,
        }
    }
}

impl<S> Locked<S>
where
    S: MemorySource,
{
    /// Runs `f` on the heap, building it first if needed
    pub fn with<R>(&self, f: impl FnOnce(&mut Allocator<S>) -> R) -> Result<R, Error> {
        let mut guard = self.heap.lock();

        let heap = match &mut *guard {
            Some(heap) => heap,
            empty => empty.insert(self.build()?),
        };

        Ok(f(heap))
    }

    fn build(&self) -> Result<Allocator<S>, Error> {
        (self.init)().and_then(Allocator::new).map_err(|e| {
            log::error!("global heap initialization failed: {}", e);
            e
        })
    }
}

unsafe impl<S> GlobalAlloc for Locked<S>
where
    S: MemorySource + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > consts::ALIGN_SIZE {
            return ptr::null_mut();
        }

        into_raw(self.with(|heap| heap.malloc(layout.size())))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > consts::ALIGN_SIZE {
            return ptr::null_mut();
        }

        into_raw(self.with(|heap| heap.calloc(1, layout.size())))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.with(|heap| heap.free(NonNull::new(ptr)));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > consts::ALIGN_SIZE {
            return ptr::null_mut();
        }

        into_raw(self.with(|heap| heap.realloc(NonNull::new(ptr), new_size)))
    }
}

fn into_raw(res: Result<Result<Option<NonNull<u8>>, Error>, Error>) -> *mut u8 {
    match res {
        Ok(Ok(Some(p))) => p.as_ptr(),
        _ => ptr::null_mut(),
    }
}
