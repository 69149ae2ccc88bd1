use tracing::debug;

use crate::storage::SequentialFile;
use crate::util::coding::decode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Notified whenever data is dropped due to detected corruption.
pub trait Reporter {
    /// `bytes` is the approximate number of bytes dropped.
    fn corruption(&mut self, bytes: u64, reason: &str);
}

/// Outcome of scanning for one physical record.
enum Physical {
    /// A record with its raw type byte; the byte may name an unknown type.
    Record { t: u8, data: Vec<u8> },
    /// Clean end of input, or the writer died mid-record.
    Eof,
    /// A corrupt region was skipped.
    Bad,
}

pub struct Reader<F: SequentialFile> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    /// Whether to verify checksums.
    checksum: bool,
    /// Backing storage for one block.
    backing: Vec<u8>,
    /// The unconsumed bytes are `backing[buffer_start..buffer_end]`.
    buffer_start: usize,
    buffer_end: usize,
    /// The last read returned fewer than BLOCK_SIZE bytes.
    eof: bool,
    /// Offset of the first fragment of the last record returned by
    /// `read_record`.
    last_record_offset: u64,
    /// File offset just past the end of the buffer.
    end_of_buffer_offset: u64,
    /// Offset at which to start looking for the first record to return.
    initial_offset: u64,
    /// True while resynchronizing after a seek (`initial_offset > 0`): a
    /// run of Middle and Last fragments belonging to a record that started
    /// before the seek point is skipped silently.
    resyncing: bool,
}

impl<F: SequentialFile> Reader<F> {
    /// Create a reader that returns the log records in `file`, reporting
    /// dropped bytes to `reporter` when one is supplied, and returning the
    /// first record at a position >= `initial_offset`.
    pub fn new(
        file: F,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Reader {
            file,
            reporter,
            checksum,
            backing: vec![0; BLOCK_SIZE],
            buffer_start: 0,
            buffer_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    #[inline]
    fn buffer_len(&self) -> usize {
        self.buffer_end - self.buffer_start
    }

    /// Read the next logical record into `record`. Returns false at end of
    /// input; corrupt regions are reported and skipped, not returned.
    pub fn read_record(&mut self, record: &mut Vec<u8>) -> bool {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return false;
        }

        record.clear();
        let mut in_fragmented_record = false;
        // Offset of the first fragment of the record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            match self.read_physical_record() {
                Physical::Record { t, mut data } => {
                    if self.resyncing {
                        match RecordType::from_u8(t) {
                            Some(RecordType::Middle) => continue,
                            Some(RecordType::Last) => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    let physical_record_offset = self.end_of_buffer_offset
                        - self.buffer_len() as u64
                        - HEADER_SIZE as u64
                        - data.len() as u64;

                    match RecordType::from_u8(t) {
                        Some(RecordType::Full) => {
                            if in_fragmented_record && !record.is_empty() {
                                // A bug in earlier writers could leave a
                                // dangling First fragment.
                                self.report_corruption(
                                    record.len() as u64,
                                    "partial record without end(1)",
                                );
                            }
                            record.clear();
                            record.append(&mut data);
                            self.last_record_offset = physical_record_offset;
                            return true;
                        }
                        Some(RecordType::First) => {
                            if in_fragmented_record && !record.is_empty() {
                                self.report_corruption(
                                    record.len() as u64,
                                    "partial record without end(2)",
                                );
                            }
                            prospective_record_offset = physical_record_offset;
                            record.clear();
                            record.append(&mut data);
                            in_fragmented_record = true;
                        }
                        Some(RecordType::Middle) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    data.len() as u64,
                                    "missing start of fragmented record(1)",
                                );
                            } else {
                                record.extend_from_slice(&data);
                            }
                        }
                        Some(RecordType::Last) => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    data.len() as u64,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                record.extend_from_slice(&data);
                                // The offset of a fragmented record is the
                                // offset of its First fragment.
                                self.last_record_offset = prospective_record_offset;
                                return true;
                            }
                        }
                        Some(RecordType::Zero) | None => {
                            // Zero-length Zero records were dropped as
                            // padding by read_physical_record, so whatever
                            // arrives here is unknown.
                            let dropped = data.len()
                                + if in_fragmented_record { record.len() } else { 0 };
                            self.report_corruption(
                                dropped as u64,
                                &format!("unknown record type {}", t),
                            );
                            in_fragmented_record = false;
                            record.clear();
                        }
                    }
                }
                Physical::Eof => {
                    if in_fragmented_record {
                        // The writer died before completing the record;
                        // hide the partial without reporting.
                        record.clear();
                    }
                    return false;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(record.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        record.clear();
                    }
                }
            }
        }
    }

    /// The physical offset of the first fragment of the last record
    /// returned by `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Hand back ownership of the underlying file.
    #[inline]
    pub fn into_file(self) -> F {
        self.file
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                self.buffer_start = 0;
                self.buffer_end = 0;
                if self.eof {
                    // A truncated header at the end of the file means the
                    // writer crashed mid-header. Report eof, not an error.
                    return Physical::Eof;
                }
                // Whatever was left was a trailer; read the next block.
                match self.file.read(&mut self.backing) {
                    Ok(n) => {
                        self.end_of_buffer_offset += n as u64;
                        self.buffer_end = n;
                        if n < BLOCK_SIZE {
                            self.eof = true;
                        }
                    }
                    Err(e) => {
                        self.report_drop(BLOCK_SIZE as u64, &e.to_string());
                        self.eof = true;
                        return Physical::Eof;
                    }
                }
                continue;
            }

            // Parse the header.
            let header_start = self.buffer_start;
            let a = self.backing[header_start + 4] as usize;
            let b = self.backing[header_start + 5] as usize;
            let t = self.backing[header_start + 6];
            let length = a | (b << 8);

            // A physical record never crosses a block boundary.
            if HEADER_SIZE + length > self.buffer_len() {
                let drop_size = self.buffer_len() as u64;
                self.buffer_start = 0;
                self.buffer_end = 0;
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // The writer died without finishing the record; don't
                // report.
                return Physical::Eof;
            }

            // Zero-length Zero records are padding from preallocation;
            // skip without reporting.
            if t == RecordType::Zero as u8 && length == 0 {
                self.buffer_start = 0;
                self.buffer_end = 0;
                return Physical::Bad;
            }

            if self.checksum {
                let expected_crc =
                    crc32::unmask(decode_fixed_32(&self.backing[header_start..]));
                let actual_crc = crc32::value(
                    &self.backing[header_start + 6..header_start + HEADER_SIZE + length],
                );
                if actual_crc != expected_crc {
                    // Drop the rest of the buffer: the length itself may
                    // be corrupted, and trusting it could surface byte
                    // runs that merely look like valid records.
                    let drop_size = self.buffer_len() as u64;
                    self.buffer_start = 0;
                    self.buffer_end = 0;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let data_start = header_start + HEADER_SIZE;
            let data = self.backing[data_start..data_start + length].to_vec();
            self.buffer_start += HEADER_SIZE + length;

            // Skip physical records that started before initial_offset.
            if (self.end_of_buffer_offset
                - self.buffer_len() as u64
                - HEADER_SIZE as u64
                - length as u64)
                < self.initial_offset
            {
                return Physical::Bad;
            }

            return Physical::Record { t, data };
        }
    }

    /// Skip all blocks entirely before the initial offset. Returns true on
    /// success; handles reporting.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start_location = self.initial_offset - offset_in_block;

        // An offset inside the trailer belongs to the next block.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        if block_start_location > 0 {
            if let Err(e) = self.file.skip(block_start_location) {
                self.report_drop(block_start_location, &e.to_string());
                return false;
            }
        }
        true
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: u64, reason: &str) {
        // Only report drops at or after the initial offset, so a resync
        // run does not double-report. The subtraction underflows exactly
        // when a read error hits before any block arrived; report then
        // too.
        let drop_offset = self
            .end_of_buffer_offset
            .checked_sub(self.buffer_len() as u64)
            .and_then(|v| v.checked_sub(bytes));
        if matches!(drop_offset, Some(offset) if offset < self.initial_offset) {
            return;
        }
        if let Some(reporter) = self.reporter.as_mut() {
            debug!(bytes, reason, "dropping log record bytes");
            reporter.corruption(bytes, reason);
        }
    }
}
