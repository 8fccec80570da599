use core::ptr::NonNull;

use libc::{c_void, intptr_t};

use crate::{consts, Error, MemorySource};

/// The process break, moved with `sbrk(2)`
///
/// The allocator needs the region to stay contiguous. If some other code in the process moves
/// the break between two extensions the new memory can't be used and `sbrk` fails with
/// `Error::NonContiguous`.
pub struct Sbrk {
    base: NonNull<u8>,
    len: usize,
}

// NOTE(safety) the memory between `base` and `base + len` belongs to this value
unsafe impl Send for Sbrk {}

impl Sbrk {
    /// Aligns the current break and starts a region there
    pub fn new() -> Result<Self, Error> {
        unsafe {
            let brk = libc::sbrk(0);
            if brk == failed() {
                return Err(Error::OutOfMemory { requested: 0 });
            }

            let pad = (consts::ALIGN_SIZE - brk as usize % consts::ALIGN_SIZE) % consts::ALIGN_SIZE;
            if pad != 0 && libc::sbrk(pad as intptr_t) == failed() {
                return Err(Error::OutOfMemory { requested: pad });
            }

            let base = NonNull::new((brk as *mut u8).add(pad))
                .ok_or(Error::OutOfMemory { requested: 0 })?;

            log::debug!("sbrk: region starts at {:p}", base);

            Ok(Sbrk { base, len: 0 })
        }
    }
}

unsafe impl MemorySource for Sbrk {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, Error> {
        if incr > isize::MAX as usize {
            return Err(Error::OutOfMemory { requested: incr });
        }

        unsafe {
            let old = libc::sbrk(incr as intptr_t);
            if old == failed() {
                log::warn!("sbrk: sbrk({}) failed", incr);
                return Err(Error::OutOfMemory { requested: incr });
            }

            let expected = self.base.as_ptr().add(self.len);
            if old as *mut u8 != expected {
                log::warn!(
                    "sbrk: break moved behind our back (expected {:p}, got {:p})",
                    expected,
                    old
                );

                // give the memory back if nobody moved the break in the meantime
                if libc::sbrk(0) == (old as *mut u8).add(incr) as *mut c_void {
                    libc::sbrk(-(incr as intptr_t));
                }
                return Err(Error::NonContiguous);
            }

            self.len += incr;
            Ok(NonNull::new_unchecked(old as *mut u8))
        }
    }
}

fn failed() -> *mut c_void {
    usize::MAX as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::Sbrk;
    use crate::{Allocator, MemorySource};

    // the test harness allocates from other threads while this runs, so the break may move
    #[test]
    #[ignore = "moves the process break"]
    fn grows_contiguously() {
        let sbrk = Sbrk::new().unwrap();
        assert_eq!(sbrk.heap_lo() as usize % 8, 0);

        let mut a = Allocator::new(sbrk).unwrap();
        let p = a.malloc(100).unwrap().unwrap();

        unsafe {
            p.as_ptr().write_bytes(0xAB, 100);
            a.free(Some(p));
        }

        assert!(a.check().is_consistent());
    }
}
