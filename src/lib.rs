//! Core substrate of a log-structured merge storage engine: an append-only
//! block-framed record log, an arena-backed skiplist memtable keyed by
//! internal keys, bloom filter blocks for table lookups, and the filesystem
//! surface (`Env`) they all run on.
//!
//! Higher layers (tables, version sets, compaction, the database handle)
//! are built on top of these pieces and live elsewhere.

pub mod db;
mod error;
pub mod filter;
pub mod iterator;
pub mod memtable;
pub mod sstable;
pub mod storage;
pub mod util;
pub mod wal;

pub use error::{Error, IResult};
pub use memtable::skiplist;
