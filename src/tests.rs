use core::ptr::NonNull;

use crate::{bucket_for, consts, util, Allocator, Error, MemLib, MemorySource};

fn heap() -> Allocator<MemLib> {
    Allocator::new(MemLib::new().unwrap()).unwrap()
}

fn alloc(heap: &mut Allocator<MemLib>, size: usize) -> NonNull<u8> {
    heap.malloc(size).unwrap().unwrap()
}

fn assert_consistent(heap: &Allocator<MemLib>) {
    let report = heap.check();
    assert!(report.is_consistent(), "{:#?}", report);
}

#[test]
fn new() {
    let heap = heap();

    assert_eq!(heap.heap_size(), consts::PREFIX_SIZE + consts::CHUNK_SIZE);

    let free: Vec<_> = heap.free_blocks().collect();
    assert_eq!(free.len(), 1);

    let (bucket, info) = free[0];
    assert_eq!(info.offset, consts::FIRST_BLOCK);
    assert_eq!(info.header.size(), consts::CHUNK_SIZE);
    assert!(info.header.is_prev_alloc());
    assert_eq!(bucket, bucket_for(consts::CHUNK_SIZE));

    assert_consistent(&heap);
}

#[test]
fn new_unaligned() {
    struct Skewed(MemLib);

    unsafe impl MemorySource for Skewed {
        fn base(&self) -> NonNull<u8> {
            unsafe { NonNull::new_unchecked(self.0.base().as_ptr().add(4)) }
        }

        fn len(&self) -> usize {
            self.0.len()
        }

        fn sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, Error> {
            self.0.sbrk(incr)
        }
    }

    let skewed = Skewed(MemLib::with_capacity(1 << 16).unwrap());
    let base = skewed.base().as_ptr() as usize;

    assert_eq!(
        Allocator::new(skewed).err(),
        Some(Error::UnalignedBase { base })
    );
}

#[test]
fn new_non_contiguous() {
    // leaves a gap before every extension but the first
    struct Gappy(MemLib);

    unsafe impl MemorySource for Gappy {
        fn base(&self) -> NonNull<u8> {
            self.0.base()
        }

        fn len(&self) -> usize {
            self.0.len()
        }

        fn sbrk(&mut self, incr: usize) -> Result<NonNull<u8>, Error> {
            if !self.0.is_empty() {
                self.0.sbrk(consts::ALIGN_SIZE)?;
            }
            self.0.sbrk(incr)
        }
    }

    let gappy = Gappy(MemLib::with_capacity(1 << 16).unwrap());

    assert_eq!(Allocator::new(gappy).err(), Some(Error::NonContiguous));
}

#[test]
fn source_too_small() {
    let mem = MemLib::with_capacity(consts::PREFIX_SIZE + consts::CHUNK_SIZE / 2).unwrap();

    assert!(matches!(
        Allocator::new(mem),
        Err(Error::OutOfMemory { .. })
    ));
}

#[test]
fn alloc_reuse() {
    let mut heap = heap();

    // X ~
    let x = alloc(&mut heap, 1);

    // X Y ~
    let y = alloc(&mut heap, 1);
    assert_ne!(x, y);

    // (X) Y ~
    unsafe { heap.free(Some(x)) };
    assert_eq!(heap.free_blocks().count(), 2);

    // Z Y ~
    // This operation will reclaim the previously freed `x` block
    let z = alloc(&mut heap, 1);
    assert_eq!(heap.free_blocks().count(), 1);
    assert_eq!(z, x);

    assert_consistent(&heap);
}

// requests are rounded up to a multiple of `ALIGN_SIZE`, overhead included
#[test]
fn align_size() {
    let mut heap = heap();

    for size in 1..=200 {
        let p = alloc(&mut heap, size);
        let usable = heap.usable_size(p);

        assert_eq!(p.as_ptr() as usize % consts::ALIGN_SIZE, 0);
        assert!(usable >= size);
        assert_eq!(
            (usable + crate::Header::SIZE) % consts::ALIGN_SIZE,
            0,
            "size {}",
            size
        );
    }

    assert_consistent(&heap);
}

#[test]
fn usable_size() {
    let mut heap = heap();

    let p = alloc(&mut heap, 1);
    assert_eq!(heap.usable_size(p), consts::MIN_BLOCK_SIZE - crate::Header::SIZE);

    let q = alloc(&mut heap, 16);
    assert_eq!(heap.usable_size(q), 20);

    let r = alloc(&mut heap, 4096);
    assert_eq!(heap.usable_size(r), 4100);
}

#[test]
fn zero_size() {
    let mut heap = heap();

    assert_eq!(heap.malloc(0), Ok(None));
    assert_eq!(heap.calloc(0, 8), Ok(None));
    assert_eq!(heap.calloc(8, 0), Ok(None));

    // no-op
    unsafe { heap.free(None) };

    assert_eq!(heap.free_blocks().count(), 1);
    assert_consistent(&heap);
}

#[test]
fn merge_both() {
    let mut heap = heap();

    // X Y Z W ~
    let x = alloc(&mut heap, 1);
    let y = alloc(&mut heap, 1);
    let z = alloc(&mut heap, 1);
    let _w = alloc(&mut heap, 1);
    assert_eq!(heap.free_blocks().count(), 1);

    // (X) Y Z W ~
    unsafe { heap.free(Some(x)) };
    assert_eq!(heap.free_blocks().count(), 2);

    // (X) Y (Z) W ~
    unsafe { heap.free(Some(z)) };
    assert_eq!(heap.free_blocks().count(), 3);

    // Previously freed `x` and `z` blocks will be merged with `y`
    // (X<-Y->Z) W ~
    unsafe { heap.free(Some(y)) };
    assert_eq!(heap.free_blocks().count(), 2);

    let merged = heap
        .free_blocks()
        .map(|(_, info)| info)
        .find(|info| info.offset == consts::FIRST_BLOCK)
        .unwrap();
    assert_eq!(merged.header.size(), 3 * consts::MIN_BLOCK_SIZE);

    assert_consistent(&heap);
}

#[test]
fn merge_prev() {
    let mut heap = heap();

    // X Y Z ~
    let x = alloc(&mut heap, 1);
    let y = alloc(&mut heap, 1);
    let _z = alloc(&mut heap, 1);

    // (X) Y Z ~
    unsafe { heap.free(Some(x)) };
    assert_eq!(heap.free_blocks().count(), 2);

    // (X<-Y) Z ~
    // Previously freed `x` block will be merged with `y`
    unsafe { heap.free(Some(y)) };
    assert_eq!(heap.free_blocks().count(), 2);

    let (bucket, info) = heap
        .free_blocks()
        .find(|(_, info)| info.offset == consts::FIRST_BLOCK)
        .unwrap();
    assert_eq!(info.header.size(), 2 * consts::MIN_BLOCK_SIZE);
    assert_eq!(bucket, bucket_for(2 * consts::MIN_BLOCK_SIZE));

    assert_consistent(&heap);
}

#[test]
fn merge_next() {
    let mut heap = heap();

    // X Y Z ~
    let x = alloc(&mut heap, 1);
    let y = alloc(&mut heap, 1);
    let _z = alloc(&mut heap, 1);

    // X (Y) Z ~
    unsafe { heap.free(Some(y)) };
    assert_eq!(heap.free_blocks().count(), 2);

    // Previously freed `y` block will be merged with `x`
    // (X->Y) Z ~
    unsafe { heap.free(Some(x)) };
    assert_eq!(heap.free_blocks().count(), 2);

    assert_consistent(&heap);
}

#[test]
fn merge_everything() {
    let mut heap = heap();

    let ptrs: Vec<_> = (1..=20).map(|i| alloc(&mut heap, i * 10)).collect();
    for (i, &p) in ptrs.iter().enumerate().rev() {
        if i % 2 == 0 {
            unsafe { heap.free(Some(p)) };
        }
    }
    for (i, &p) in ptrs.iter().enumerate() {
        if i % 2 == 1 {
            unsafe { heap.free(Some(p)) };
        }
    }

    // back to a single free block spanning the whole heap
    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].header.is_alloc());
    assert_eq!(blocks[0].header.size(), consts::CHUNK_SIZE);

    assert_consistent(&heap);
}

#[test]
fn lifo_reuse() {
    let mut heap = heap();

    let ptrs: Vec<_> = (0..10).map(|_| alloc(&mut heap, 16)).collect();
    for &i in &[3, 5, 7] {
        unsafe { heap.free(Some(ptrs[i])) };
    }

    // three blocks that held 16-byte requests, plus what is left of the first chunk
    let asize = util::adjust_size(16).unwrap();
    let small: Vec<_> = heap
        .free_blocks()
        .filter(|&(bucket, _)| bucket == bucket_for(asize))
        .map(|(_, info)| info)
        .collect();
    assert_eq!(small.len(), 3);
    assert!(small.iter().all(|info| info.header.size() == asize));
    assert_eq!(heap.free_blocks().count(), 4);

    // most recently freed first
    let offsets: Vec<_> = small.iter().map(|info| info.offset).collect();
    let expected: Vec<_> = [7, 5, 3]
        .iter()
        .map(|&i| ptrs[i].as_ptr() as usize - heap.heap_bounds().0 as usize)
        .collect();
    assert_eq!(offsets, expected);

    let p = alloc(&mut heap, 16);
    assert_eq!(p, ptrs[7]);
    assert_eq!(heap.free_blocks().count(), 3);

    assert_consistent(&heap);
}

#[test]
fn reuse_before_growth() {
    let mut heap = heap();
    let (lo, hi) = heap.heap_bounds();

    let p = alloc(&mut heap, 4096);
    unsafe { heap.free(Some(p)) };

    // both fit in the space `p` left behind
    let _a = alloc(&mut heap, 2000);
    let _b = alloc(&mut heap, 2000);
    assert_eq!(heap.heap_bounds(), (lo, hi));

    // this one doesn't; the heap grows by one chunk and the new space is merged with the tail
    let _c = alloc(&mut heap, 5000);
    let (lo2, hi2) = heap.heap_bounds();
    assert_eq!(lo2, lo);
    assert_eq!(hi2 as usize - hi as usize, consts::CHUNK_SIZE);

    assert_consistent(&heap);
}

#[test]
fn grow_for_large_request() {
    let mut heap = heap();
    let before = heap.heap_size();

    let p = alloc(&mut heap, 3 * consts::CHUNK_SIZE);
    assert!(heap.usable_size(p) >= 3 * consts::CHUNK_SIZE);
    assert!(heap.heap_size() > before);

    // payload is writable up to the end
    unsafe { p.as_ptr().write_bytes(0x5A, 3 * consts::CHUNK_SIZE) };

    assert_consistent(&heap);
}

#[test]
fn calloc() {
    let mut heap = heap();

    // leave garbage where the next allocation will land
    let p = alloc(&mut heap, 400);
    unsafe {
        p.as_ptr().write_bytes(0xFF, 400);
        heap.free(Some(p));
    }

    let q = heap.calloc(100, 4).unwrap().unwrap();
    assert_eq!(q, p);

    let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 400) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert_consistent(&heap);
}

#[test]
fn calloc_overflow() {
    let mut heap = heap();

    assert_eq!(
        heap.calloc(usize::MAX, 2),
        Err(Error::Overflow {
            count: usize::MAX,
            size: 2
        })
    );
    assert_eq!(heap.free_blocks().count(), 1);
}

#[test]
fn oom() {
    let mem = MemLib::with_capacity(consts::PREFIX_SIZE + consts::CHUNK_SIZE).unwrap();
    let mut heap = Allocator::new(mem).unwrap();

    // the whole chunk minus the header is too much
    assert!(matches!(
        heap.malloc(consts::CHUNK_SIZE),
        Err(Error::OutOfMemory { .. })
    ));

    // the failure didn't damage the heap
    assert_consistent(&heap);
    let p = alloc(&mut heap, consts::CHUNK_SIZE - crate::Header::SIZE);
    assert_eq!(heap.free_blocks().count(), 0);

    assert!(matches!(heap.malloc(1), Err(Error::OutOfMemory { .. })));
    unsafe { heap.free(Some(p)) };
    assert_consistent(&heap);
}

#[test]
fn exceed_block_size() {
    let mut heap = heap();

    assert_eq!(
        heap.malloc(usize::MAX),
        Err(Error::OutOfMemory {
            requested: usize::MAX
        })
    );
    assert!(heap.malloc(consts::MAX_BLOCK_SIZE).is_err());
    assert_consistent(&heap);
}

#[test]
fn realloc() {
    let mut heap = heap();

    unsafe {
        let x = alloc(&mut heap, 16);
        for i in 0..16 {
            *x.as_ptr().add(i) = i as u8;
        }

        // grow; the contents move along
        let y = heap.realloc(Some(x), 100).unwrap().unwrap();
        assert_ne!(x, y);
        assert!((0..16).all(|i| *y.as_ptr().add(i) == i as u8));

        // shrink; the prefix survives
        let z = heap.realloc(Some(y), 4).unwrap().unwrap();
        assert!((0..4).all(|i| *z.as_ptr().add(i) == i as u8));

        // only `z` is live
        assert_eq!(
            heap.blocks().filter(|b| b.header.is_alloc()).count(),
            1
        );

        heap.free(Some(z));
    }

    assert_eq!(heap.free_blocks().count(), 1);
    assert_consistent(&heap);
}

#[test]
fn realloc_edge_cases() {
    let mut heap = heap();

    unsafe {
        // null pointer: same as malloc
        let p = heap.realloc(None, 10).unwrap().unwrap();
        assert!(heap.usable_size(p) >= 10);

        // zero size: same as free
        assert_eq!(heap.realloc(Some(p), 0), Ok(None));
        assert_eq!(heap.realloc(None, 0), Ok(None));
    }

    assert_eq!(heap.free_blocks().count(), 1);
    assert_consistent(&heap);
}

#[test]
fn realloc_failure_keeps_block() {
    let mem = MemLib::with_capacity(consts::PREFIX_SIZE + consts::CHUNK_SIZE).unwrap();
    let mut heap = Allocator::new(mem).unwrap();

    unsafe {
        let p = alloc(&mut heap, 64);
        p.as_ptr().write_bytes(0xC3, 64);

        assert!(heap.realloc(Some(p), 2 * consts::CHUNK_SIZE).is_err());

        // still allocated, still intact
        assert!((0..64).all(|i| *p.as_ptr().add(i) == 0xC3));
        heap.free(Some(p));
    }

    assert_consistent(&heap);
}

#[test]
fn blocks_cover_heap() {
    let mut heap = heap();

    for size in &[1, 50, 700, 3000, 9000] {
        alloc(&mut heap, *size);
    }

    let total: usize = heap.blocks().map(|b| b.header.size()).sum();
    assert_eq!(total, heap.heap_size() - consts::PREFIX_SIZE);

    let (lo, hi) = heap.heap_bounds();
    assert_eq!(hi as usize - lo as usize + 1, heap.heap_size());
}

#[test]
fn reuse_source() {
    let mut heap = heap();
    alloc(&mut heap, 100);

    let mut mem = heap.into_source();
    mem.reset();

    let heap = Allocator::new(mem).unwrap();
    assert_eq!(heap.free_blocks().count(), 1);
    assert_consistent(&heap);
}

#[test]
#[should_panic]
fn free_foreign_pointer() {
    let mut heap = heap();
    let mut other = Box::new(0u64);

    unsafe { heap.free(Some(NonNull::from(&mut *other).cast())) };
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn double_free() {
    let mut heap = heap();
    let p = alloc(&mut heap, 8);
    let _q = alloc(&mut heap, 8);

    unsafe {
        heap.free(Some(p));
        heap.free(Some(p));
    }
}

#[test]
fn debug() {
    let mut heap = heap();
    let p = alloc(&mut heap, 100);
    let _q = alloc(&mut heap, 100);
    unsafe { heap.free(Some(p)) };

    let s = format!("{:?}", heap);
    assert!(s.starts_with("Allocator"));
    assert!(s.contains("free_lists"));
    assert!(s.contains(&format!("{:?}", bucket_for(util::adjust_size(100).unwrap()))));
}

struct XorShift64(u64);

impl XorShift64 {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

// random malloc / free / realloc traffic; live blocks must never overlap or lose their contents
#[test]
fn storm() {
    struct Live {
        ptr: NonNull<u8>,
        size: usize,
        tag: u8,
    }

    unsafe fn verify(live: &Live) {
        let bytes = core::slice::from_raw_parts(live.ptr.as_ptr(), live.size);
        assert!(bytes.iter().all(|&b| b == live.tag));
    }

    let mut heap = heap();
    let mut rng = XorShift64(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..5_000 {
        let size = if rng.below(64) == 0 {
            1 + rng.below(20_000)
        } else {
            1 + rng.below(2048)
        };
        let tag = step as u8;

        match rng.below(4) {
            0 | 1 if live.len() < 256 => {
                let ptr = alloc(&mut heap, size);
                unsafe { ptr.as_ptr().write_bytes(tag, size) };
                live.push(Live { ptr, size, tag });
            }

            2 if !live.is_empty() => {
                let victim = live.swap_remove(rng.below(live.len()));
                unsafe {
                    verify(&victim);
                    heap.free(Some(victim.ptr));
                }
            }

            _ if !live.is_empty() => {
                let i = rng.below(live.len());
                let old = &live[i];
                unsafe {
                    verify(old);
                    let ptr = heap.realloc(Some(old.ptr), size).unwrap().unwrap();
                    let kept = core::cmp::min(old.size, size);
                    let bytes = core::slice::from_raw_parts(ptr.as_ptr(), kept);
                    assert!(bytes.iter().all(|&b| b == old.tag));

                    ptr.as_ptr().write_bytes(tag, size);
                    live[i] = Live { ptr, size, tag };
                }
            }

            _ => {}
        }

        if step % 250 == 0 {
            let mut spans: Vec<_> = live
                .iter()
                .map(|l| (l.ptr.as_ptr() as usize, heap.usable_size(l.ptr)))
                .collect();
            spans.sort();
            for pair in spans.windows(2) {
                assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap at step {}", step);
            }

            assert_consistent(&heap);
        }
    }

    for l in live.drain(..) {
        unsafe {
            verify(&l);
            heap.free(Some(l.ptr));
        }
    }

    // everything merged back
    assert_eq!(heap.free_blocks().count(), 1);
    assert_consistent(&heap);
}
