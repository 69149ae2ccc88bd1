use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_SIZE: usize = 4096;
const MAX_ALLOC_SIZE: usize = 16 * 1024 * 1024;

/// A bump allocator over heap blocks. Allocations are never individually
/// freed; everything is released when the arena is dropped, and every
/// pointer handed out stays valid until then (blocks never move).
///
/// A single owner performs allocations. Concurrent readers may only call
/// `memory_usage`, which is backed by a relaxed atomic. The memtable
/// upholds this by funneling all allocations through its externally
/// serialized write path.
pub struct Arena {
    inner: UnsafeCell<ArenaInner>,
    mem_usage: AtomicUsize,
}

struct ArenaInner {
    /// Bump state for the current block.
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
    blocks: Vec<Box<[u8]>>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Arena::new()
    }
}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            inner: UnsafeCell::new(ArenaInner {
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
                blocks: Vec::new(),
            }),
            mem_usage: AtomicUsize::new(0),
        }
    }

    /// Return a pointer to `bytes` fresh contiguous bytes with char
    /// alignment. `bytes` must be in `(0, MAX_ALLOC_SIZE)`.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0 && bytes < MAX_ALLOC_SIZE);
        let inner = unsafe { &mut *self.inner.get() };
        if bytes <= inner.alloc_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return result;
        }
        self.allocate_fallback(inner, bytes)
    }

    /// Like `allocate`, but the result is aligned to the pointer width.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0 && bytes < MAX_ALLOC_SIZE);
        const ALIGN: usize = std::mem::size_of::<*mut u8>();

        let inner = unsafe { &mut *self.inner.get() };
        let current_mod = inner.alloc_ptr as usize & (ALIGN - 1);
        let slop = if current_mod == 0 { 0 } else { ALIGN - current_mod };
        let needed = bytes + slop;

        let result = if needed <= inner.alloc_remaining {
            let result = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_remaining -= needed;
            result
        } else {
            // Fresh blocks come straight from the global allocator, which
            // aligns at least to pointer width.
            self.allocate_fallback(inner, bytes)
        };
        debug_assert_eq!(result as usize & (ALIGN - 1), 0);
        result
    }

    /// An estimate of the memory used by the arena. Safe to call from any
    /// thread.
    pub fn memory_usage(&self) -> usize {
        self.mem_usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&self, inner: &mut ArenaInner, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // A large request gets its own block so the leftover bytes of
            // the current block are not wasted.
            return self.allocate_new_block(inner, bytes);
        }

        inner.alloc_ptr = self.allocate_new_block(inner, BLOCK_SIZE);
        inner.alloc_remaining = BLOCK_SIZE;

        let result = inner.alloc_ptr;
        inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
        inner.alloc_remaining -= bytes;
        result
    }

    fn allocate_new_block(&self, inner: &mut ArenaInner, block_bytes: usize) -> *mut u8 {
        let mut block = vec![0u8; block_bytes].into_boxed_slice();
        let result = block.as_mut_ptr();
        inner.blocks.push(block);
        // Count the bookkeeping pointer along with the block itself.
        self.mem_usage.fetch_add(
            block_bytes + std::mem::size_of::<*mut u8>(),
            Ordering::Relaxed,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::random::Random;

    #[test]
    fn test_empty() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_alloc_fill_and_usage() {
        const N: usize = 100000;
        let mut allocated: Vec<(usize, *mut u8)> = Vec::new();
        let arena = Arena::new();
        let mut bytes = 0usize;
        let mut rnd = Random::new(301);

        for i in 0..N {
            let mut s = if i % (N / 10) == 0 {
                i
            } else if rnd.one_in(4000) {
                rnd.uniform(6000) as usize
            } else if rnd.one_in(10) {
                rnd.uniform(100) as usize
            } else {
                rnd.uniform(20) as usize
            };
            // The arena disallows size 0 allocations.
            if s == 0 {
                s = 1;
            }

            let r = if rnd.one_in(10) {
                arena.allocate_aligned(s)
            } else {
                arena.allocate(s)
            };

            // Fill the i-th allocation with a known bit pattern.
            unsafe {
                std::ptr::write_bytes(r, (i % 256) as u8, s);
            }
            bytes += s;
            allocated.push((s, r));

            assert!(arena.memory_usage() >= bytes);
            if i > N / 10 {
                assert!(arena.memory_usage() as f64 <= bytes as f64 * 1.10);
            }
        }

        for (i, &(num_bytes, p)) in allocated.iter().enumerate() {
            let data = unsafe { std::slice::from_raw_parts(p, num_bytes) };
            for &b in data {
                assert_eq!(b, (i % 256) as u8);
            }
        }
    }

    #[test]
    fn test_aligned_allocations() {
        let arena = Arena::new();
        let align = std::mem::size_of::<*mut u8>();
        // Odd-sized plain allocations knock the bump pointer off alignment.
        for i in 1..100 {
            arena.allocate(i % 7 + 1);
            let p = arena.allocate_aligned(i);
            assert_eq!(p as usize % align, 0);
        }
    }

    #[test]
    fn test_large_allocation_gets_own_block() {
        let arena = Arena::new();
        arena.allocate(16);
        let before = arena.memory_usage();
        // Larger than a quarter block: served from a dedicated block while
        // the current block keeps accepting small allocations.
        arena.allocate(BLOCK_SIZE);
        assert!(arena.memory_usage() >= before + BLOCK_SIZE);
        arena.allocate(16);
        assert_eq!(
            arena.memory_usage(),
            before + BLOCK_SIZE + std::mem::size_of::<*mut u8>()
        );
    }
}
