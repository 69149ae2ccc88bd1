use crate::IResult;

/// Access to a sequence of key/value pairs from a table or memtable.
/// Positioning methods leave the iterator either on an entry (`valid()`)
/// or off the end of the sequence.
pub trait Iter {
    /// True iff the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Position at the first entry. Valid iff the source is not empty.
    fn seek_to_first(&mut self);

    /// Position at the last entry. Valid iff the source is not empty.
    fn seek_to_last(&mut self);

    /// Position at the first entry with a key at or past `target`.
    fn seek(&mut self, target: &[u8]);

    /// Advance to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Move back to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// The key at the current position. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the current position. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// The first error this iterator encountered, if any.
    fn status(&mut self) -> IResult<()>;
}
