//! An ordered, insert-only skiplist with lock-free reads.
//!
//! Thread safety: insertions require external synchronization, most likely
//! a mutex. Reads (`contains`, iteration) require only a guarantee that the
//! skiplist outlives the read; they run without internal locking and may
//! proceed concurrently with one inserter.
//!
//! Invariants:
//!
//! 1. Allocated nodes are never deleted until the skiplist is destroyed;
//!    nodes live in the arena that the skiplist owns.
//! 2. Everything in a node except its next pointers is immutable once the
//!    node has been linked. Only `insert` modifies the list, and it
//!    publishes nodes with release stores.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::mem::MaybeUninit;
use std::ptr::{self, addr_of_mut, null_mut};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memtable::arena::Arena;
use crate::util::random::Random;

pub const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Three-way comparison over skiplist keys.
pub trait KeyComparator<K>: Send + Sync {
    fn compare_key(&self, a: &K, b: &K) -> CmpOrdering;
}

#[repr(C)]
struct Node<K> {
    /// Uninitialized only in the head node, whose key is never compared.
    key: MaybeUninit<K>,
    height: usize,
    /// Variable length: a node of height h is allocated with room for h
    /// pointers, and only those h entries may be touched. `next[0]` is the
    /// lowest level link.
    next: [AtomicPtr<Node<K>>; 1],
}

impl<K> Node<K> {
    unsafe fn key(&self) -> &K {
        self.key.assume_init_ref()
    }

    unsafe fn next_atomic(&self, level: usize) -> &AtomicPtr<Node<K>> {
        debug_assert!(level < self.height);
        &*self.next.as_ptr().add(level)
    }

    unsafe fn next(&self, level: usize) -> *mut Node<K> {
        // An acquire load pairs with the release store in `set_next`, so a
        // reader that sees the pointer also sees the node's contents.
        self.next_atomic(level).load(Ordering::Acquire)
    }

    unsafe fn set_next(&self, level: usize, node: *mut Node<K>) {
        self.next_atomic(level).store(node, Ordering::Release)
    }

    unsafe fn no_barrier_next(&self, level: usize) -> *mut Node<K> {
        self.next_atomic(level).load(Ordering::Relaxed)
    }

    unsafe fn no_barrier_set_next(&self, level: usize, node: *mut Node<K>) {
        self.next_atomic(level).store(node, Ordering::Relaxed)
    }
}

/// Allocate a node of the given height in place in the arena. The trailing
/// pointer array is sized to the height, so the allocation is
/// `size_of::<Node>() + (height - 1)` pointers.
fn new_node<K>(arena: &Arena, key: MaybeUninit<K>, height: usize) -> *mut Node<K> {
    debug_assert!(height >= 1 && height <= MAX_HEIGHT);
    let size = std::mem::size_of::<Node<K>>()
        + (height - 1) * std::mem::size_of::<AtomicPtr<Node<K>>>();
    let node = arena.allocate_aligned(size) as *mut Node<K>;
    unsafe {
        ptr::write(addr_of_mut!((*node).key), key);
        ptr::write(addr_of_mut!((*node).height), height);
        let next = addr_of_mut!((*node).next) as *mut AtomicPtr<Node<K>>;
        for level in 0..height {
            ptr::write(next.add(level), AtomicPtr::new(null_mut()));
        }
    }
    node
}

struct SkiplistCore<K, C> {
    cmp: C,
    arena: Arena,
    head: *mut Node<K>,
    max_height: AtomicUsize,
    /// Only the (externally serialized) inserter draws heights.
    rnd: UnsafeCell<Random>,
}

// Keys are either plain values or pointers into the arena the core owns,
// so sharing the core shares nothing that outlives it.
unsafe impl<K, C: Send> Send for SkiplistCore<K, C> {}
unsafe impl<K, C: Sync> Sync for SkiplistCore<K, C> {}

pub struct Skiplist<K: Copy, C: KeyComparator<K>> {
    core: Arc<SkiplistCore<K, C>>,
}

impl<K: Copy, C: KeyComparator<K>> Clone for Skiplist<K, C> {
    fn clone(&self) -> Self {
        Skiplist {
            core: self.core.clone(),
        }
    }
}

impl<K: Copy, C: KeyComparator<K>> Skiplist<K, C> {
    pub fn new(cmp: C) -> Skiplist<K, C> {
        let arena = Arena::new();
        let head = new_node::<K>(&arena, MaybeUninit::uninit(), MAX_HEIGHT);
        Skiplist {
            core: Arc::new(SkiplistCore {
                cmp,
                arena,
                head,
                max_height: AtomicUsize::new(1),
                rnd: UnsafeCell::new(Random::new(0xdeadbeef)),
            }),
        }
    }

    /// The arena backing this list. Callers may intern keys here before
    /// inserting pointers to them.
    pub fn arena(&self) -> &Arena {
        &self.core.arena
    }

    pub fn memory_usage(&self) -> usize {
        self.core.arena.memory_usage()
    }

    fn max_height(&self) -> usize {
        // A stale height is harmless: the reader just starts its descent
        // from a lower level and still sees a correct sublist.
        self.core.max_height.load(Ordering::Relaxed)
    }

    fn random_height(&self) -> usize {
        // Increase height with probability 1 in BRANCHING.
        let rnd = unsafe { &mut *self.core.rnd.get() };
        let mut height = 1;
        while height < MAX_HEIGHT && rnd.one_in(BRANCHING) {
            height += 1;
        }
        debug_assert!(height >= 1 && height <= MAX_HEIGHT);
        height
    }

    unsafe fn key_is_after_node(&self, key: &K, node: *mut Node<K>) -> bool {
        !node.is_null() && self.core.cmp.compare_key((*node).key(), key) == CmpOrdering::Less
    }

    /// Return the earliest node at or after `key`, filling `prev` with the
    /// rightmost node before `key` on every level when requested.
    unsafe fn find_greater_or_equal(
        &self,
        key: &K,
        mut prev: Option<&mut [*mut Node<K>; MAX_HEIGHT]>,
    ) -> *mut Node<K> {
        let mut level = self.max_height() - 1;
        let mut cur = self.core.head;
        loop {
            let next = (*cur).next(level);
            if self.key_is_after_node(key, next) {
                // Keep searching in this level.
                cur = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = cur;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Return the latest node with a key before `key`, or head.
    unsafe fn find_less_than(&self, key: &K) -> *mut Node<K> {
        let mut level = self.max_height() - 1;
        let mut cur = self.core.head;
        loop {
            let next = (*cur).next(level);
            if next.is_null() || self.core.cmp.compare_key((*next).key(), key) != CmpOrdering::Less
            {
                if level == 0 {
                    return cur;
                }
                level -= 1;
            } else {
                cur = next;
            }
        }
    }

    /// Return the last node in the list, or head if the list is empty.
    unsafe fn find_last(&self) -> *mut Node<K> {
        let mut level = self.max_height() - 1;
        let mut cur = self.core.head;
        loop {
            let next = (*cur).next(level);
            if !next.is_null() {
                cur = next;
            } else if level == 0 {
                return cur;
            } else {
                level -= 1;
            }
        }
    }

    /// Insert `key` into the list. The key must not already be present,
    /// and callers must serialize insertions externally.
    pub fn insert(&self, key: K) {
        let mut prev: [*mut Node<K>; MAX_HEIGHT] = [null_mut(); MAX_HEIGHT];
        let node = unsafe { self.find_greater_or_equal(&key, Some(&mut prev)) };

        unsafe {
            assert!(
                node.is_null()
                    || self.core.cmp.compare_key((*node).key(), &key) != CmpOrdering::Equal,
                "duplicate key inserted into skiplist"
            );
        }

        let height = self.random_height();
        let max_height = self.max_height();
        if height > max_height {
            for p in prev.iter_mut().take(height).skip(max_height) {
                *p = self.core.head;
            }
            // No synchronization needed here: a concurrent reader that
            // observes the new height before the new node sees null next
            // pointers from the head, which is valid.
            self.core.max_height.store(height, Ordering::Relaxed);
        }

        let node = new_node(&self.core.arena, MaybeUninit::new(key), height);
        unsafe {
            for level in 0..height {
                // The relaxed copy is invisible until the release store
                // below publishes the node.
                (*node).no_barrier_set_next(level, (*prev[level]).no_barrier_next(level));
                (*prev[level]).set_next(level, node);
            }
        }
    }

    /// True iff an entry that compares equal to `key` is in the list. Safe
    /// to call concurrently with one inserter.
    pub fn contains(&self, key: &K) -> bool {
        let node = unsafe { self.find_greater_or_equal(key, None) };
        !node.is_null()
            && unsafe { self.core.cmp.compare_key((*node).key(), key) == CmpOrdering::Equal }
    }
}

/// Iteration over the contents of a skiplist. The iterator holds its own
/// handle on the list, so the nodes it walks stay live.
pub struct SkiplistIterator<K: Copy, C: KeyComparator<K>> {
    list: Skiplist<K, C>,
    node: *const Node<K>,
}

impl<K: Copy, C: KeyComparator<K>> SkiplistIterator<K, C> {
    pub fn new(list: Skiplist<K, C>) -> Self {
        SkiplistIterator {
            list,
            node: ptr::null(),
        }
    }

    /// True iff the iterator is positioned at a node.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The key at the current position. Requires `valid()`.
    pub fn key(&self) -> &K {
        assert!(self.valid());
        unsafe { (*self.node).key() }
    }

    /// Advance to the next node. Requires `valid()`.
    pub fn next(&mut self) {
        assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Retreat to the previous node. Requires `valid()`. Implemented as a
    /// search instead of back links.
    pub fn prev(&mut self) {
        assert!(self.valid());
        unsafe {
            let node = self.list.find_less_than((*self.node).key());
            self.node = if node == self.list.core.head {
                ptr::null()
            } else {
                node
            };
        }
    }

    /// Position at the first node with a key >= `target`.
    pub fn seek(&mut self, target: &K) {
        self.node = unsafe { self.list.find_greater_or_equal(target, None) };
    }

    /// Position at the first node. Valid iff the list is not empty.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.core.head).next(0) };
    }

    /// Position at the last node. Valid iff the list is not empty.
    pub fn seek_to_last(&mut self) {
        unsafe {
            let node = self.list.find_last();
            self.node = if node == self.list.core.head {
                ptr::null()
            } else {
                node
            };
        }
    }
}
