use crate::filter::FilterPolicy;
use crate::util::hash::hash;

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, 0xbc9f1d34)
}

/// A bloom filter policy with approximately `bits_per_key` bits per key.
/// 10 bits per key yields a filter with roughly a 1% false positive rate.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    /// Number of probes per key, less than bits_per_key to reduce probing
    /// cost a little bit.
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // We intentionally round down to reduce probing cost a little bit.
        let k = (bits_per_key as f64 * 0.69) as usize; // 0.69 =~ ln(2)
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "stackdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Compute the bloom filter size in bits; a floor of 64 avoids a
        // very high false positive rate for tiny key sets.
        let mut bits = keys.len() * self.bits_per_key;
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        // Remember the number of probes in the filter itself.
        dst.push(self.k as u8);

        let array = &mut dst[init_size..init_size + bytes];
        for key in keys {
            // Double hashing: one base hash, stepped by its rotation.
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bitpos = h as usize % bits;
                array[bitpos / 8] |= 1 << (bitpos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }

        let array = &filter[..len - 1];
        let bits = array.len() * 8;

        // The probe count a potentially different policy instance used.
        let k = filter[len - 1] as usize;
        if k > 30 {
            // Reserved for potentially new encodings; match everything.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bitpos = h as usize % bits;
            if array[bitpos / 8] & (1 << (bitpos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::coding::put_fixed_32;

    fn int_key(i: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        put_fixed_32(&mut buf, i);
        buf
    }

    fn next_length(length: usize) -> usize {
        if length < 10 {
            length + 1
        } else if length < 100 {
            length + 10
        } else if length < 1000 {
            length + 100
        } else {
            length + 1000
        }
    }

    struct BloomHarness {
        policy: BloomFilterPolicy,
        filter: Vec<u8>,
        keys: Vec<Vec<u8>>,
    }

    impl BloomHarness {
        fn new() -> Self {
            BloomHarness {
                policy: BloomFilterPolicy::new(10),
                filter: Vec::new(),
                keys: Vec::new(),
            }
        }

        fn reset(&mut self) {
            self.keys.clear();
            self.filter.clear();
        }

        fn add(&mut self, key: &[u8]) {
            self.keys.push(key.to_vec());
        }

        fn build(&mut self) {
            let key_slices: Vec<&[u8]> = self.keys.iter().map(|k| k.as_slice()).collect();
            self.filter.clear();
            self.policy.create_filter(&key_slices, &mut self.filter);
            self.keys.clear();
        }

        fn filter_size(&self) -> usize {
            self.filter.len()
        }

        fn matches(&mut self, key: &[u8]) -> bool {
            if !self.keys.is_empty() {
                self.build();
            }
            self.policy.key_may_match(key, &self.filter)
        }

        fn false_positive_rate(&mut self) -> f64 {
            let mut result = 0;
            for i in 0..10000 {
                if self.matches(&int_key(i + 1000000000)) {
                    result += 1;
                }
            }
            result as f64 / 10000.0
        }
    }

    #[test]
    fn test_empty_filter() {
        let mut bloom = BloomHarness::new();
        assert!(!bloom.matches(b"hello"));
        assert!(!bloom.matches(b"world"));
    }

    #[test]
    fn test_small() {
        let mut bloom = BloomHarness::new();
        bloom.add(b"hello");
        bloom.add(b"world");
        assert!(bloom.matches(b"hello"));
        assert!(bloom.matches(b"world"));
        assert!(!bloom.matches(b"x"));
        assert!(!bloom.matches(b"foo"));
    }

    #[test]
    fn test_varying_lengths() {
        let mut bloom = BloomHarness::new();

        // Count the filters whose false positive rate is above target.
        let mut mediocre_filters = 0;
        let mut good_filters = 0;

        let mut length = 1;
        while length <= 10000 {
            bloom.reset();
            for i in 0..length {
                bloom.add(&int_key(i as u32));
            }
            bloom.build();

            assert!(
                bloom.filter_size() <= length * 10 / 8 + 40,
                "oversized filter at length {}",
                length
            );

            // All added keys must match.
            for i in 0..length {
                assert!(bloom.matches(&int_key(i as u32)), "length {}; key {}", length, i);
            }

            let rate = bloom.false_positive_rate();
            assert!(rate <= 0.02, "rate {} at length {}", rate, length);
            if rate > 0.0125 {
                mediocre_filters += 1;
            } else {
                good_filters += 1;
            }

            length = next_length(length);
        }
        assert!(mediocre_filters <= good_filters / 5);
    }

    #[test]
    fn test_reserved_probe_count_matches_everything() {
        let policy = BloomFilterPolicy::new(10);
        // A one-byte bit array plus a probe count from a future encoding.
        let filter = vec![0u8, 31];
        assert!(policy.key_may_match(b"anything", &filter));
    }
}
