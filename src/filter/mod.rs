pub mod bloom;

pub use bloom::BloomFilterPolicy;

/// A policy for summarizing a set of keys into a small filter that is
/// stored next to the data and consulted before reading from disk.
pub trait FilterPolicy: Send + Sync {
    /// The name of this policy. If the filter encoding changes in an
    /// incompatible way, the name must change too; otherwise old,
    /// incompatible filters may be passed to this policy.
    fn name(&self) -> &str;

    /// Append a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Must return true if `key` was in the set the filter was built from.
    /// May return true for other keys, but should aim to return false with
    /// a high probability.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}
