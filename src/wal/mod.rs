//! The append-only record log. A log file is a stream of 32 KiB blocks;
//! each block holds physical records of the form
//! `crc32c_masked (4 LE) | length (2 LE) | type (1) | payload`,
//! and a payload too large for one block is split into First/Middle/Last
//! fragments. Trailing block space smaller than a header is zero-filled.

pub mod reader;
pub mod writer;


pub use reader::{Reader, Reporter};
pub use writer::Writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Reserved for preallocated files.
    Zero = 0,
    Full = 1,

    // Fragment types.
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<RecordType> {
        match v {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

pub const MAX_RECORD_TYPE: usize = RecordType::Last as usize;

pub const BLOCK_SIZE: usize = 32768;

/// Checksum (4 bytes) + length (2 bytes) + type (1 byte).
pub const HEADER_SIZE: usize = 4 + 2 + 1;
