//! An in-memory ordered table of internal-key -> value entries, backed by
//! an arena-allocated skiplist.
//!
//! ```text
//!                                 memtable key | memtable value
//!
//!              varint size | user key | packed seq/type          varint size | value
//! memtable key:         11 | "abc"    | 1234567 | 1     value:             3 | "yes"
//! ```
//!
//! Entries are encoded straight into arena memory and the skiplist stores
//! each entry's base pointer. Reads are safe against one concurrent `add`;
//! two concurrent `add` calls are a caller bug.

pub mod arena;
pub mod skiplist;

use std::cmp::Ordering;

use crate::db::format::{
    pack_seq_and_type, LookupKey, InternalKeyComparator, SeqNum, ValueType, INTERNAL_KEY_TAIL,
};
use crate::iterator::Iter;
use crate::memtable::skiplist::{KeyComparator, Skiplist, SkiplistIterator};
use crate::util::coding::{
    decode_fixed_64, encode_fixed_64, encode_varint_32, put_varint_32, varint_length,
};
use crate::util::comparator::Comparator;
use crate::{Error, IResult};

/// The skiplist key: the base pointer of an arena-encoded entry.
type EntryPtr = *const u8;

/// Decode the varint at `p`. The caller guarantees a well formed varint is
/// present, which holds for every entry this module encodes.
unsafe fn decode_varint_32_raw(mut p: *const u8) -> (u32, *const u8) {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *p as u32;
        p = p.add(1);
        if byte & 128 != 0 {
            result |= (byte & 127) << shift;
            shift += 7;
        } else {
            result |= byte << shift;
            return (result, p);
        }
    }
}

/// The length-prefixed slice starting at `p`.
unsafe fn get_length_prefixed_slice<'a>(p: *const u8) -> &'a [u8] {
    let (len, data) = decode_varint_32_raw(p);
    std::slice::from_raw_parts(data, len as usize)
}

/// Compares entries by the internal keys embedded in them.
#[derive(Clone)]
pub struct EntryComparator<C: Comparator> {
    cmp: InternalKeyComparator<C>,
}

impl<C: Comparator> EntryComparator<C> {
    fn new(cmp: InternalKeyComparator<C>) -> Self {
        EntryComparator { cmp }
    }
}

impl<C: Comparator> KeyComparator<EntryPtr> for EntryComparator<C> {
    fn compare_key(&self, a: &EntryPtr, b: &EntryPtr) -> Ordering {
        let (ka, kb) = unsafe { (get_length_prefixed_slice(*a), get_length_prefixed_slice(*b)) };
        self.cmp.compare(ka, kb)
    }
}

pub struct MemTable<C: Comparator + Clone> {
    cmp: InternalKeyComparator<C>,
    table: Skiplist<EntryPtr, EntryComparator<C>>,
}

impl<C: Comparator + Clone> MemTable<C> {
    /// Share a memtable with `Arc::new`; the arena and every entry in it
    /// are freed when the last handle drops.
    pub fn new(cmp: InternalKeyComparator<C>) -> Self {
        let table = Skiplist::new(EntryComparator::new(cmp.clone()));
        MemTable { cmp, table }
    }

    /// An approximation of the bytes in use by this table.
    pub fn approximate_memory_usage(&self) -> usize {
        self.table.memory_usage()
    }

    /// Add an entry that maps `user_key` to `value` at the given sequence
    /// number. `value` is typically empty when `t` is a deletion. Callers
    /// serialize writes.
    pub fn add(&self, seq: SeqNum, t: ValueType, user_key: &[u8], value: &[u8]) {
        // Entry layout:
        //   varint32 of internal key length
        //   user key bytes
        //   packed seq/type fixed64
        //   varint32 of value length
        //   value bytes
        let internal_key_size = user_key.len() + INTERNAL_KEY_TAIL;
        let encoded_len = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();

        let base = self.table.arena().allocate(encoded_len);
        let buf = unsafe { std::slice::from_raw_parts_mut(base, encoded_len) };

        let mut pos = encode_varint_32(buf, internal_key_size as u32);
        buf[pos..pos + user_key.len()].copy_from_slice(user_key);
        pos += user_key.len();
        encode_fixed_64(&mut buf[pos..], pack_seq_and_type(seq, t));
        pos += INTERNAL_KEY_TAIL;
        pos += encode_varint_32(&mut buf[pos..], value.len() as u32);
        buf[pos..pos + value.len()].copy_from_slice(value);
        debug_assert_eq!(pos + value.len(), encoded_len);

        self.table.insert(base as EntryPtr);
    }

    /// Look up the entry visible to `key`'s snapshot.
    ///
    /// Returns `Some(Ok(value))` when the table holds a live value,
    /// `Some(Err(NotFound))` when it holds a deletion for the key, and
    /// `None` when the user key is absent entirely.
    pub fn get(&self, key: &LookupKey) -> Option<IResult<Vec<u8>>> {
        let mem_key = key.memtable_key();
        let mut iter = SkiplistIterator::new(self.table.clone());
        iter.seek(&(mem_key.as_ptr() as EntryPtr));
        if !iter.valid() {
            return None;
        }

        // The seek landed on the first entry at or after
        // (user_key, seq, SEEK). Entries with larger sequence numbers were
        // skipped by the packed ordering, so only the user key needs
        // checking before the tag decides the outcome.
        let entry = *iter.key();
        unsafe {
            let ikey = get_length_prefixed_slice(entry);
            let user_key = &ikey[..ikey.len() - INTERNAL_KEY_TAIL];
            if self
                .cmp
                .user_comparator()
                .compare(user_key, key.user_key())
                != Ordering::Equal
            {
                return None;
            }

            let seq_type = decode_fixed_64(&ikey[ikey.len() - INTERNAL_KEY_TAIL..]);
            match (seq_type & 0xff) as u8 {
                tag if tag == ValueType::Value as u8 => {
                    let value = get_length_prefixed_slice(ikey.as_ptr().add(ikey.len()));
                    Some(Ok(value.to_vec()))
                }
                _ => Some(Err(Error::NotFound(String::new()))),
            }
        }
    }

    /// An iterator over the table. `key()` yields internal keys as encoded
    /// by `append_internal_key`, `value()` the raw value bytes. The
    /// iterator keeps the underlying storage alive.
    pub fn iter(&self) -> MemTableIterator<C> {
        MemTableIterator {
            iter: SkiplistIterator::new(self.table.clone()),
            scratch: Vec::new(),
        }
    }
}

pub struct MemTableIterator<C: Comparator + Clone> {
    iter: SkiplistIterator<EntryPtr, EntryComparator<C>>,
    /// Holds the encoded form of seek targets.
    scratch: Vec<u8>,
}

impl<C: Comparator + Clone> Iter for MemTableIterator<C> {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // The table compares memtable keys, so wrap the internal key in a
        // length prefix first.
        self.scratch.clear();
        put_varint_32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.iter.seek(&(self.scratch.as_ptr() as EntryPtr));
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        unsafe { get_length_prefixed_slice(*self.iter.key()) }
    }

    fn value(&self) -> &[u8] {
        unsafe {
            let ikey = get_length_prefixed_slice(*self.iter.key());
            get_length_prefixed_slice(ikey.as_ptr().add(ikey.len()))
        }
    }

    fn status(&mut self) -> IResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::parse_internal_key;
    use crate::util::comparator::BytewiseComparator;
    use std::sync::Arc;

    fn new_memtable() -> MemTable<BytewiseComparator> {
        MemTable::new(InternalKeyComparator::new(BytewiseComparator))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_memtable();
        mem.add(100, ValueType::Value, b"foo", b"v1");
        mem.add(101, ValueType::Value, b"bar", b"v2");

        let got = mem.get(&LookupKey::new(b"foo", 200)).unwrap().unwrap();
        assert_eq!(got, b"v1");
        let got = mem.get(&LookupKey::new(b"bar", 200)).unwrap().unwrap();
        assert_eq!(got, b"v2");
        assert!(mem.get(&LookupKey::new(b"baz", 200)).is_none());
    }

    #[test]
    fn test_snapshot_visibility() {
        let mem = new_memtable();
        mem.add(100, ValueType::Value, b"key", b"old");
        mem.add(102, ValueType::Value, b"key", b"new");

        // A snapshot between the two writes sees the old value.
        assert_eq!(
            mem.get(&LookupKey::new(b"key", 101)).unwrap().unwrap(),
            b"old"
        );
        // The exact sequence of a write sees that write.
        assert_eq!(
            mem.get(&LookupKey::new(b"key", 100)).unwrap().unwrap(),
            b"old"
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"key", 200)).unwrap().unwrap(),
            b"new"
        );
        // A snapshot before the first write sees nothing.
        assert!(mem.get(&LookupKey::new(b"key", 99)).is_none());
    }

    #[test]
    fn test_deletion_is_reported() {
        let mem = new_memtable();
        mem.add(10, ValueType::Value, b"key", b"value");
        mem.add(11, ValueType::Deletion, b"key", b"");

        // The tombstone wins at a late snapshot.
        let got = mem.get(&LookupKey::new(b"key", 20)).unwrap();
        assert!(got.unwrap_err().is_not_found());
        // The old value is still visible below the tombstone.
        assert_eq!(
            mem.get(&LookupKey::new(b"key", 10)).unwrap().unwrap(),
            b"value"
        );
    }

    #[test]
    fn test_empty_user_key_and_value() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"", b"");
        let got = mem.get(&LookupKey::new(b"", 5)).unwrap().unwrap();
        assert_eq!(got, b"");
    }

    #[test]
    fn test_iterator_order() {
        let mem = new_memtable();
        mem.add(3, ValueType::Value, b"b", b"vb");
        mem.add(1, ValueType::Value, b"a", b"va1");
        mem.add(2, ValueType::Value, b"a", b"va2");

        let mut iter = mem.iter();
        iter.seek_to_first();

        // User keys ascend; at equal user keys the newer entry comes
        // first.
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = parse_internal_key(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.seq, iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 2, b"va2".to_vec()),
                (b"a".to_vec(), 1, b"va1".to_vec()),
                (b"b".to_vec(), 3, b"vb".to_vec()),
            ]
        );

        // Seeking at an internal key lands on the first entry at or after
        // it under the packed ordering.
        iter.seek(LookupKey::new(b"a", 1).internal_key());
        assert!(iter.valid());
        let parsed = parse_internal_key(iter.key()).unwrap();
        assert_eq!(parsed.user_key, b"a");
        assert_eq!(parsed.seq, 1);
    }

    #[test]
    fn test_iterator_outlives_handle() {
        let mem = Arc::new(new_memtable());
        mem.add(1, ValueType::Value, b"k", b"v");
        let mut iter = mem.iter();
        drop(mem);
        // The iterator still owns the storage through the skiplist.
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"v");
    }

    #[test]
    fn test_memory_usage_grows() {
        let mem = new_memtable();
        let before = mem.approximate_memory_usage();
        for i in 0..100u32 {
            mem.add(i as u64 + 1, ValueType::Value, format!("key{}", i).as_bytes(), &[0u8; 100]);
        }
        assert!(mem.approximate_memory_usage() > before);
    }
}
