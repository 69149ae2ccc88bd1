//! The POSIX `Env` backend.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::Mmap;
use tracing::warn;

use crate::storage::{Env, RandomAccessFile, SequentialFile, WritableFile};
use crate::{Error, IResult};

const WRITABLE_FILE_BUFFER_SIZE: usize = 64 * 1024;

/// Up to 1000 mmap regions for 64-bit binaries, none for 32-bit ones,
/// which have far less virtual address space to spare.
const DEFAULT_MMAP_LIMIT: i64 = if std::mem::size_of::<*const ()>() >= 8 {
    1000
} else {
    0
};

static READ_FD_LIMIT: AtomicI64 = AtomicI64::new(-1);
static MMAP_LIMIT: AtomicI64 = AtomicI64::new(-1);

/// Override the budget of open read-only file descriptors. Takes effect
/// for environments constructed afterwards; call before the first use of
/// `default_env`.
pub fn set_read_fd_limit(limit: i64) {
    READ_FD_LIMIT.store(limit, Ordering::Relaxed);
}

/// Override the budget of mmap regions. Takes effect for environments
/// constructed afterwards; call before the first use of `default_env`.
pub fn set_mmap_limit(limit: i64) {
    MMAP_LIMIT.store(limit, Ordering::Relaxed);
}

fn max_mmaps() -> i64 {
    let configured = MMAP_LIMIT.load(Ordering::Relaxed);
    if configured >= 0 {
        configured
    } else {
        DEFAULT_MMAP_LIMIT
    }
}

fn max_open_fds() -> i64 {
    let configured = READ_FD_LIMIT.load(Ordering::Relaxed);
    if configured >= 0 {
        return configured;
    }
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        // The limit could not be queried; fall back to a small budget.
        50
    } else if rlim.rlim_cur == libc::RLIM_INFINITY {
        i64::MAX
    } else {
        // Allow one fifth of the available fds for read-only files.
        (rlim.rlim_cur / 5) as i64
    }
}

/// Translate an I/O failure on `context` into the engine's error value.
/// A missing file keeps its own code so callers can recover from it.
fn posix_error(context: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("{}: {}", context.display(), err))
    } else {
        Error::IO(std::io::Error::new(
            err.kind(),
            format!("{}: {}", context.display(), err),
        ))
    }
}

/// Limits resource usage to avoid exhaustion. Used for read-only fds and
/// mmap regions; the count is advisory, hence relaxed atomics.
#[derive(Debug)]
struct Limiter {
    acquires_allowed: AtomicI64,
}

impl Limiter {
    fn new(max_acquires: i64) -> Self {
        Limiter {
            acquires_allowed: AtomicI64::new(max_acquires),
        }
    }

    /// Take one resource if any is available.
    fn acquire(&self) -> bool {
        let old = self.acquires_allowed.fetch_sub(1, Ordering::Relaxed);
        if old > 0 {
            return true;
        }
        self.acquires_allowed.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Give back a resource obtained from `acquire`.
    fn release(&self) {
        self.acquires_allowed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct PosixSequentialFile {
    file: File,
    path: PathBuf,
}

impl SequentialFile for PosixSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> IResult<usize> {
        loop {
            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(posix_error(&self.path, e)),
            }
        }
    }

    fn skip(&mut self, n: u64) -> IResult<()> {
        self.file
            .seek(SeekFrom::Current(n as i64))
            .map_err(|e| posix_error(&self.path, e))?;
        Ok(())
    }
}

/// Random access through `pread`. Keeps a permanent descriptor when the fd
/// budget allows it, otherwise reopens the file on every read.
#[derive(Debug)]
pub struct PosixPreadFile {
    file: Option<File>,
    path: PathBuf,
    limiter: Arc<Limiter>,
}

impl PosixPreadFile {
    fn new(path: PathBuf, file: File, limiter: Arc<Limiter>) -> Self {
        let file = if limiter.acquire() { Some(file) } else { None };
        PosixPreadFile {
            file,
            path,
            limiter,
        }
    }
}

impl Drop for PosixPreadFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.limiter.release();
        }
    }
}

impl RandomAccessFile for PosixPreadFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> IResult<usize> {
        let reopened;
        let file = match &self.file {
            Some(file) => file,
            None => {
                reopened = File::open(&self.path).map_err(|e| posix_error(&self.path, e))?;
                &reopened
            }
        };
        file.read_at(buf, offset)
            .map_err(|e| posix_error(&self.path, e))
    }
}

/// Random access over a memory map of the whole file.
#[derive(Debug)]
pub struct PosixMmapFile {
    map: Mmap,
    path: PathBuf,
    limiter: Arc<Limiter>,
}

impl Drop for PosixMmapFile {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl RandomAccessFile for PosixMmapFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> IResult<usize> {
        let offset = offset as usize;
        if offset + buf.len() > self.map.len() {
            return Err(Error::InvalidArgument(format!(
                "{}: read past end of file",
                self.path.display()
            )));
        }
        buf.copy_from_slice(&self.map[offset..offset + buf.len()]);
        Ok(buf.len())
    }
}

#[derive(Debug)]
pub enum PosixRandomAccessFile {
    Mmap(PosixMmapFile),
    Pread(PosixPreadFile),
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> IResult<usize> {
        match self {
            PosixRandomAccessFile::Mmap(file) => file.read(offset, buf),
            PosixRandomAccessFile::Pread(file) => file.read(offset, buf),
        }
    }
}

pub struct PosixWritableFile {
    /// None once closed.
    file: Option<File>,
    /// Data waiting to be written; never grows past
    /// WRITABLE_FILE_BUFFER_SIZE.
    buf: Vec<u8>,
    path: PathBuf,
    dirname: PathBuf,
    is_manifest: bool,
}

impl PosixWritableFile {
    fn new(path: PathBuf, file: File) -> Self {
        let is_manifest = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with("MANIFEST"))
            .unwrap_or(false);
        let dirname = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| parent.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        PosixWritableFile {
            file: Some(file),
            buf: Vec::with_capacity(WRITABLE_FILE_BUFFER_SIZE),
            path,
            dirname,
            is_manifest,
        }
    }

    fn file(&self) -> IResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument(format!("{}: file is closed", self.path.display())))
    }

    fn flush_buffer(&mut self) -> IResult<()> {
        let result = self.write_unbuffered(&self.buf);
        self.buf.clear();
        result
    }

    fn write_unbuffered(&self, data: &[u8]) -> IResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.file()?;
        file.write_all(data).map_err(|e| posix_error(&self.path, e))
    }

    /// Make the entries of the containing directory durable, so that a
    /// file the manifest refers to cannot vanish after the manifest commit
    /// survives a crash.
    fn sync_dir(&self) -> IResult<()> {
        let dir = File::open(&self.dirname).map_err(|e| posix_error(&self.dirname, e))?;
        dir.sync_all().map_err(|e| posix_error(&self.dirname, e))
    }
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> IResult<()> {
        // Fit as much as possible into the buffer.
        let copy = data.len().min(WRITABLE_FILE_BUFFER_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..copy]);
        let rest = &data[copy..];
        if rest.is_empty() {
            return Ok(());
        }

        // The buffer is full; at least one real write is due.
        self.flush_buffer()?;
        if rest.len() < WRITABLE_FILE_BUFFER_SIZE {
            self.buf.extend_from_slice(rest);
            return Ok(());
        }
        // Large writes skip the buffer entirely.
        self.write_unbuffered(rest)
    }

    fn flush(&mut self) -> IResult<()> {
        self.flush_buffer()
    }

    fn sync(&mut self) -> IResult<()> {
        if self.is_manifest {
            self.sync_dir()?;
        }
        self.flush_buffer()?;
        self.file()?
            .sync_data()
            .map_err(|e| posix_error(&self.path, e))
    }

    fn close(&mut self) -> IResult<()> {
        let result = self.flush_buffer();
        // Dropping the handle closes the descriptor.
        self.file = None;
        result
    }
}

impl Drop for PosixWritableFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.flush_buffer();
        }
    }
}

/// A held lock on a file. Return it to `Env::unlock_file` to release; the
/// fcntl lock also dies with the process.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

fn lock_or_unlock(file: &File, lock: bool) -> std::io::Result<()> {
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = (if lock { libc::F_WRLCK } else { libc::F_UNLCK }) as libc::c_short;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = 0;
    flock.l_len = 0; // lock or unlock the whole file
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &flock) };
    if rc == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub struct PosixEnv {
    mmap_limiter: Arc<Limiter>,
    fd_limiter: Arc<Limiter>,
    /// Paths locked by this process. fcntl(F_SETLK) does not protect
    /// against multiple uses from the same process, so a separate table
    /// has to.
    locks: Mutex<HashSet<PathBuf>>,
}

impl Default for PosixEnv {
    fn default() -> Self {
        PosixEnv::new()
    }
}

impl PosixEnv {
    pub fn new() -> Self {
        PosixEnv {
            mmap_limiter: Arc::new(Limiter::new(max_mmaps())),
            fd_limiter: Arc::new(Limiter::new(max_open_fds())),
            locks: Mutex::new(HashSet::new()),
        }
    }
}

impl Env for PosixEnv {
    type SeqFile = PosixSequentialFile;
    type RandFile = PosixRandomAccessFile;
    type WrFile = PosixWritableFile;
    type Lock = FileLock;

    fn new_sequential_file(&self, path: &Path) -> IResult<PosixSequentialFile> {
        let file = File::open(path).map_err(|e| posix_error(path, e))?;
        Ok(PosixSequentialFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn new_random_access_file(&self, path: &Path) -> IResult<PosixRandomAccessFile> {
        let file = File::open(path).map_err(|e| posix_error(path, e))?;
        if !self.mmap_limiter.acquire() {
            return Ok(PosixRandomAccessFile::Pread(PosixPreadFile::new(
                path.to_path_buf(),
                file,
                self.fd_limiter.clone(),
            )));
        }
        match unsafe { Mmap::map(&file) } {
            Ok(map) => Ok(PosixRandomAccessFile::Mmap(PosixMmapFile {
                map,
                path: path.to_path_buf(),
                limiter: self.mmap_limiter.clone(),
            })),
            Err(e) => {
                self.mmap_limiter.release();
                Err(posix_error(path, e))
            }
        }
    }

    fn new_writable_file(&self, path: &Path) -> IResult<PosixWritableFile> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| posix_error(path, e))?;
        Ok(PosixWritableFile::new(path.to_path_buf(), file))
    }

    fn new_appendable_file(&self, path: &Path) -> IResult<PosixWritableFile> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| posix_error(path, e))?;
        Ok(PosixWritableFile::new(path.to_path_buf(), file))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, dir: &Path) -> IResult<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| posix_error(dir, e))?;
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| posix_error(dir, e))?;
            result.push(entry.path());
        }
        Ok(result)
    }

    fn get_file_size(&self, path: &Path) -> IResult<u64> {
        let meta = fs::metadata(path).map_err(|e| posix_error(path, e))?;
        Ok(meta.len())
    }

    fn remove_file(&self, path: &Path) -> IResult<()> {
        fs::remove_file(path).map_err(|e| posix_error(path, e))
    }

    fn create_dir(&self, dir: &Path) -> IResult<()> {
        fs::create_dir(dir).map_err(|e| posix_error(dir, e))
    }

    fn remove_dir(&self, dir: &Path) -> IResult<()> {
        fs::remove_dir(dir).map_err(|e| posix_error(dir, e))
    }

    fn rename_file(&self, src: &Path, target: &Path) -> IResult<()> {
        fs::rename(src, target).map_err(|e| posix_error(src, e))
    }

    fn lock_file(&self, path: &Path) -> IResult<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| posix_error(path, e))?;

        if !self.locks.lock().unwrap().insert(path.to_path_buf()) {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("lock {}: already held by process", path.display()),
            )));
        }

        if let Err(e) = lock_or_unlock(&file, true) {
            self.locks.lock().unwrap().remove(path);
            return Err(posix_error(path, e));
        }

        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    fn unlock_file(&self, lock: FileLock) -> IResult<()> {
        let result = lock_or_unlock(&lock.file, false).map_err(|e| posix_error(&lock.path, e));
        self.locks.lock().unwrap().remove(&lock.path);
        result
    }

    fn schedule(&self, _f: Box<dyn FnOnce() + Send>) -> IResult<()> {
        warn!("PosixEnv::schedule is not implemented");
        Err(Error::NotSupported("PosixEnv::schedule".to_owned()))
    }

    fn start_thread(&self, _f: Box<dyn FnOnce() + Send>) -> IResult<()> {
        warn!("PosixEnv::start_thread is not implemented");
        Err(Error::NotSupported("PosixEnv::start_thread".to_owned()))
    }

    fn get_test_dir(&self) -> IResult<PathBuf> {
        let path = match std::env::var("TEST_TMPDIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(format!("/tmp/stackdbtest-{}", unsafe { libc::geteuid() })),
        };
        // The directory may already exist.
        let _ = self.create_dir(&path);
        Ok(path)
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }

    fn sleep_for_microseconds(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// The process-wide default environment. Constructed lazily on first use;
/// budget overrides via `set_read_fd_limit`/`set_mmap_limit` must happen
/// before that.
pub fn default_env() -> &'static PosixEnv {
    static DEFAULT: OnceLock<PosixEnv> = OnceLock::new();
    DEFAULT.get_or_init(PosixEnv::new)
}
