//! The filesystem and clock surface the engine runs on. Each trait is a
//! capability contract implemented by a concrete backend; the only backend
//! shipped here is POSIX.

pub mod posix;

use std::path::{Path, PathBuf};

use crate::IResult;

pub use posix::{default_env, set_mmap_limit, set_read_fd_limit, FileLock, PosixEnv};

/// A file abstraction for reading sequentially through a file. Not safe
/// for concurrent use by multiple threads.
pub trait SequentialFile {
    /// Read up to `buf.len()` bytes, returning the length of the filled
    /// prefix. A short count signals end of file.
    fn read(&mut self, buf: &mut [u8]) -> IResult<usize>;

    /// Skip `n` bytes ahead. This is not slower than reading the same
    /// bytes, and may well be faster.
    fn skip(&mut self, n: u64) -> IResult<()>;
}

/// A file abstraction for randomly reading the contents of a file. Safe
/// for concurrent use by multiple threads.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`, returning the
    /// length of the filled prefix.
    fn read(&self, offset: u64, buf: &mut [u8]) -> IResult<usize>;
}

/// A file abstraction for sequential writing. Implementations must buffer
/// internally, since callers may append small fragments at a time. Not
/// safe for concurrent use by multiple threads.
pub trait WritableFile {
    fn append(&mut self, data: &[u8]) -> IResult<()>;

    /// Push buffered data to the operating system.
    fn flush(&mut self) -> IResult<()>;

    /// Push buffered data to the operating system and on to durable
    /// storage.
    fn sync(&mut self) -> IResult<()>;

    /// Flush and close. The file is unusable afterwards.
    fn close(&mut self) -> IResult<()>;
}

/// Operating system functionality used by the engine: files, directories,
/// locks, and the clock. Callers may supply a custom implementation to get
/// fine-grained control (e.g. to rate-limit filesystem operations).
///
/// All `Env` implementations are safe for concurrent access from multiple
/// threads without external synchronization.
pub trait Env: Send + Sync {
    type SeqFile: SequentialFile;
    type RandFile: RandomAccessFile;
    type WrFile: WritableFile;
    type Lock;

    /// Open `path` for sequential reading.
    fn new_sequential_file(&self, path: &Path) -> IResult<Self::SeqFile>;

    /// Open `path` for random-access reading.
    fn new_random_access_file(&self, path: &Path) -> IResult<Self::RandFile>;

    /// Create (or truncate) `path` for writing.
    fn new_writable_file(&self, path: &Path) -> IResult<Self::WrFile>;

    /// Open (or create) `path` for appending.
    fn new_appendable_file(&self, path: &Path) -> IResult<Self::WrFile>;

    fn file_exists(&self, path: &Path) -> bool;

    /// The entries of directory `dir`.
    fn get_children(&self, dir: &Path) -> IResult<Vec<PathBuf>>;

    fn get_file_size(&self, path: &Path) -> IResult<u64>;

    fn remove_file(&self, path: &Path) -> IResult<()>;

    fn create_dir(&self, dir: &Path) -> IResult<()>;

    fn remove_dir(&self, dir: &Path) -> IResult<()>;

    fn rename_file(&self, src: &Path, target: &Path) -> IResult<()>;

    /// Lock `path` without blocking, so that concurrent processes (and
    /// other holders in this process) cannot lock the same file. Release
    /// with `unlock_file`.
    fn lock_file(&self, path: &Path) -> IResult<Self::Lock>;

    /// Release a lock acquired by `lock_file`.
    fn unlock_file(&self, lock: Self::Lock) -> IResult<()>;

    /// Arrange to run `f` once in a background thread. Declared for the
    /// layers above; a backend may not support it.
    fn schedule(&self, f: Box<dyn FnOnce() + Send>) -> IResult<()>;

    /// Start a thread running `f`; the thread is destroyed when `f`
    /// returns. Declared for the layers above; a backend may not support
    /// it.
    fn start_thread(&self, f: Box<dyn FnOnce() + Send>) -> IResult<()>;

    /// A directory that can be used for testing. Created if necessary.
    fn get_test_dir(&self) -> IResult<PathBuf>;

    /// Microseconds since some fixed point in the past. Only useful for
    /// computing deltas.
    fn now_micros(&self) -> u64;

    fn sleep_for_microseconds(&self, micros: u64);
}

/// Write `data` to the named file.
pub fn write_string_to_file<E: Env>(env: &E, data: &[u8], path: &Path) -> IResult<()> {
    do_write_string_to_file(env, data, path, false)
}

/// Write `data` to the named file and sync it to durable storage.
pub fn write_string_to_file_sync<E: Env>(env: &E, data: &[u8], path: &Path) -> IResult<()> {
    do_write_string_to_file(env, data, path, true)
}

fn do_write_string_to_file<E: Env>(
    env: &E,
    data: &[u8],
    path: &Path,
    should_sync: bool,
) -> IResult<()> {
    let mut file = env.new_writable_file(path)?;
    let result = file
        .append(data)
        .and_then(|_| if should_sync { file.sync() } else { Ok(()) })
        .and_then(|_| file.close());
    if result.is_err() {
        let _ = env.remove_file(path);
    }
    result
}

/// Read the contents of the named file.
pub fn read_file_to_string<E: Env>(env: &E, path: &Path) -> IResult<Vec<u8>> {
    let mut file = env.new_sequential_file(path)?;
    let mut data = Vec::new();
    let mut scratch = vec![0u8; 8192];
    loop {
        let n = file.read(&mut scratch)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&scratch[..n]);
    }
    Ok(data)
}
