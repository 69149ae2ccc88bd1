use crate::storage::WritableFile;
use crate::util::coding::encode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::IResult;

pub struct Writer<F: WritableFile> {
    dest: F,
    /// Current offset within the current block.
    block_offset: usize,
    /// crc32c values for each record type. Pre-computed to reduce the
    /// overhead of checksumming the type byte stored in the header.
    type_crc: [u32; MAX_RECORD_TYPE + 1],
}

impl<F: WritableFile> Writer<F> {
    pub fn new(dest: F) -> Self {
        Self::with_offset(dest, 0)
    }

    /// Create a writer that appends to a log file already holding
    /// `dest_len` bytes.
    pub fn with_offset(dest: F, dest_len: u64) -> Self {
        let mut type_crc = [0u32; MAX_RECORD_TYPE + 1];
        for (t, crc) in type_crc.iter_mut().enumerate() {
            *crc = crc32::value(&[t as u8]);
        }
        Writer {
            dest,
            block_offset: (dest_len % BLOCK_SIZE as u64) as usize,
            type_crc,
        }
    }

    /// Append a record to the log. Fragments the payload across blocks as
    /// needed; even an empty payload emits one zero-length Full fragment.
    pub fn add_record(&mut self, record: &[u8]) -> IResult<()> {
        let mut left = record.len();
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not enough room for a header; fill the trailer with
                // zeros (relies on HEADER_SIZE being 7) and switch to a
                // new block.
                if leftover > 0 {
                    self.dest.append(&[0u8; 6][..leftover])?;
                }
                self.block_offset = 0;
            }

            // Invariant: we never leave less than HEADER_SIZE free bytes
            // in a block.
            debug_assert!(BLOCK_SIZE - self.block_offset >= HEADER_SIZE);

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = if left < avail { left } else { avail };
            let end = left == fragment_length;
            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            let start = record.len() - left;
            self.emit_physical_record(record_type, &record[start..start + fragment_length])?;
            left -= fragment_length;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(&mut self, t: RecordType, data: &[u8]) -> IResult<()> {
        let length = data.len();
        assert!(
            length <= 0xffff,
            "record fragment of {} bytes does not fit the 2-byte length field",
            length
        );
        debug_assert!(self.block_offset + HEADER_SIZE + length <= BLOCK_SIZE);

        // Header: checksum[0..4] | length[4..6] | type[6].
        let mut header = [0u8; HEADER_SIZE];
        header[4] = (length & 0xff) as u8;
        header[5] = (length >> 8) as u8;
        header[6] = t as u8;

        // The stored checksum covers the type byte and the payload, masked
        // because it is embedded in the very stream being checksummed.
        let crc = crc32::mask(crc32::extend(self.type_crc[t as usize], data));
        encode_fixed_32(&mut header, crc);

        self.dest.append(&header)?;
        self.dest.append(data)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + length;
        Ok(())
    }

    /// Hand back ownership of the underlying file.
    #[inline]
    pub fn into_file(self) -> F {
        self.dest
    }
}
