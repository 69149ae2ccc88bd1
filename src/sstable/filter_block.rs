//! A filter block is stored near the end of a table file and groups one
//! filter per aligned range of data-block offsets:
//!
//! ```text
//! filter_0 | filter_1 | ... | offset table (u32 LE each)
//!   | offset of offset table (u32 LE) | base log (u8)
//! ```
//!
//! Filter `i` covers keys of the data blocks whose file offsets fall in
//! `[i << base_log, (i + 1) << base_log)`.

use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_32, put_fixed_32};

/// Generate a new filter every 2 KiB of data.
pub const FILTER_BASE_LOG: usize = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LOG;

/// Constructs all the filters for one table, producing a single string
/// stored as the table's filter block.
///
/// The sequence of calls must match the regexp
/// `(start_block add_key*)* finish`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key contents for the current filter.
    keys: Vec<u8>,
    /// Starting index in `keys` of each key.
    start: Vec<usize>,
    /// Filter data computed so far.
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Announce that keys added from now on belong to the data block that
    /// starts at `block_offset`. Ranges skipped over get empty filters.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(
            filter_index >= self.filter_offsets.len() as u64,
            "blocks must be started in offset order"
        );
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Flush the pending filter and append the offset table and trailer.
    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        // Append the filter offset array.
        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed_32(&mut self.result, offset);
        }

        put_fixed_32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LOG as u8);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        if num_keys == 0 {
            // An empty filter is encoded as a repeated offset.
            self.filter_offsets.push(self.result.len() as u32);
            return;
        }

        // Sentinel so start[i + 1] is valid for the last key.
        self.start.push(self.keys.len());
        let tmp_keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();

        self.filter_offsets.push(self.result.len() as u32);
        self.policy.create_filter(&tmp_keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

pub struct FilterBlockReader<'a> {
    policy: Arc<dyn FilterPolicy>,
    /// The whole filter block; empty when the trailer did not parse.
    data: &'a [u8],
    /// Byte offset of the offset table within `data`.
    offset: usize,
    /// Number of entries in the offset table.
    num: usize,
    base_log: usize,
}

impl<'a> FilterBlockReader<'a> {
    /// `contents` must stay live while the reader is in use.
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: &'a [u8]) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: &[],
            offset: 0,
            num: 0,
            base_log: 0,
        };

        // 1 byte of base log plus 4 bytes of offset-table position.
        let n = contents.len();
        if n < 5 {
            return reader;
        }
        reader.base_log = contents[n - 1] as usize;
        let offset = decode_fixed_32(&contents[n - 5..]) as usize;
        if offset > n - 5 {
            return reader;
        }

        reader.data = contents;
        reader.offset = offset;
        reader.num = (n - 5 - offset) / 4;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let filter_index = (block_offset >> self.base_log) as usize;
        if filter_index < self.num {
            let entry = self.offset + filter_index * 4;
            let start = decode_fixed_32(&self.data[entry..]) as usize;
            let limit = decode_fixed_32(&self.data[entry + 4..]) as usize;

            if start < limit && limit <= self.offset {
                let filter = &self.data[start..limit];
                return self.policy.key_may_match(key, filter);
            } else if start == limit {
                // Empty filters do not match any keys.
                return false;
            }
        }
        // Out-of-range lookups and structural errors are treated as
        // potential matches.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::coding::put_fixed_32;
    use crate::util::hash::hash;

    /// For testing: a "filter" holding one hash value per key.
    struct TestHashFilter;

    impl FilterPolicy for TestHashFilter {
        fn name(&self) -> &str {
            "TestHashFilter"
        }

        fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
            for key in keys {
                put_fixed_32(dst, hash(key, 1));
            }
        }

        fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
            let h = hash(key, 1);
            filter
                .chunks_exact(4)
                .any(|word| decode_fixed_32(word) == h)
        }
    }

    #[test]
    fn test_empty_builder() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        let block = builder.finish().to_vec();
        assert_eq!(block, [0, 0, 0, 0, FILTER_BASE_LOG as u8]);

        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), &block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100000, b"foo"));
    }

    #[test]
    fn test_single_chunk() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), &block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(200, b"foo"));
        assert!(reader.key_may_match(300, b"hello"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_multi_chunk() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));

        // First filter.
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Second filter.
        builder.start_block(3100);
        builder.add_key(b"box");

        // Third filter is empty.

        // Last filter.
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), &block);

        // Check the first filter.
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(0, b"hello"));

        // Check the second filter.
        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));
        assert!(!reader.key_may_match(3100, b"bar"));
        assert!(!reader.key_may_match(3100, b"hello"));

        // Check the third filter (empty).
        assert!(!reader.key_may_match(4100, b"foo"));
        assert!(!reader.key_may_match(4100, b"bar"));
        assert!(!reader.key_may_match(4100, b"box"));
        assert!(!reader.key_may_match(4100, b"hello"));

        // Check the last filter.
        assert!(reader.key_may_match(9000, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
        assert!(!reader.key_may_match(9000, b"bar"));
    }

    #[test]
    fn test_bloom_backed_block() {
        let policy = Arc::new(crate::filter::BloomFilterPolicy::new(10));
        let mut builder = FilterBlockBuilder::new(policy.clone());
        builder.start_block(0);
        builder.add_key(b"alpha");
        builder.add_key(b"beta");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy, &block);
        assert!(reader.key_may_match(0, b"alpha"));
        assert!(reader.key_may_match(0, b"beta"));
    }

    #[test]
    fn test_corrupt_trailer_matches_everything() {
        // An offset-table position beyond the block makes the reader
        // treat every probe as a potential match.
        let block = vec![0xff, 0xff, 0xff, 0xff, FILTER_BASE_LOG as u8];
        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), &block);
        assert!(reader.key_may_match(0, b"foo"));
    }
}
