//! Append-only files with a shared read-only memory map.
//!
//! Writers append through an in-process buffer and publish new data with
//! [`MmapFile::save_and_remap`]. Readers borrow [`MappedSlice`]s that hold an
//! `Arc` of the mapping they were cut from, so a remap never invalidates a
//! slice that is still in use; the last holder of an old mapping unmaps it.

use std::{
    fs::{File, OpenOptions},
    io,
    ops::{Deref, Range},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::types::{IavlError, Result};

mod struct_file;

pub use struct_file::{Record, StructFile};

/// Buffered bytes are written out once they exceed this size.
const APPEND_BUFFER_BYTES: usize = 64 * 1024;

#[cfg(unix)]
/// Unix positional I/O using pread/pwrite semantics.
pub mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    /// Reads exactly `dst.len()` bytes at `off`.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows positional I/O using seek_read/seek_write semantics.
pub mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    /// Reads exactly `dst.len()` bytes at `off`.
    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Fsyncs a directory so renames inside it are durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Fsyncs a directory so renames inside it are durable.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn pread_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    stdio_unix::read_exact(file, off, dst)
}

#[cfg(windows)]
fn pread_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    stdio_win::read_exact(file, off, dst)
}

#[cfg(unix)]
fn pwrite_all(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    stdio_unix::write_all(file, off, src)
}

#[cfg(windows)]
fn pwrite_all(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    stdio_win::write_all(file, off, src)
}

#[cfg(not(any(unix, windows)))]
fn pread_exact(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positional reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn pwrite_all(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positional writes unsupported on this platform",
    ))
}

#[allow(unsafe_code)]
fn map_read_only(file: &File) -> io::Result<Mmap> {
    // SAFETY: the mapping is read-only and files are only ever appended to or
    // patched in fixed-width fields through positional writes; no holder ever
    // truncates a file below a length that an outstanding mapping covers.
    unsafe { Mmap::map(file) }
}

/// Byte range of a shared mapping; keeps the mapping alive while held.
#[derive(Clone)]
pub struct MappedSlice {
    map: Arc<Mmap>,
    range: Range<usize>,
}

impl MappedSlice {
    /// Converts into `Bytes` without copying.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for MappedSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[self.range.clone()]
    }
}

impl AsRef<[u8]> for MappedSlice {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

struct AppendState {
    pending: Vec<u8>,
    flushed: u64,
}

/// Append-only file with a read-only mapping of its flushed prefix.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    append: Mutex<AppendState>,
    map: RwLock<Option<Arc<Mmap>>>,
    mapped_len: AtomicU64,
}

impl MmapFile {
    /// Opens or creates `path` and maps its current contents.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let flushed = file.metadata()?.len();
        let this = Self {
            path,
            file,
            append: Mutex::new(AppendState {
                pending: Vec::new(),
                flushed,
            }),
            map: RwLock::new(None),
            mapped_len: AtomicU64::new(0),
        };
        this.remap_to(flushed)?;
        Ok(this)
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length: flushed bytes plus bytes still buffered.
    pub fn len(&self) -> u64 {
        let state = self.append.lock();
        state.flushed + state.pending.len() as u64
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes visible through the mapping.
    pub fn mapped_len(&self) -> u64 {
        self.mapped_len.load(Ordering::Acquire)
    }

    /// Appends `src`, returning the offset it starts at.
    pub fn append(&self, src: &[u8]) -> Result<u64> {
        let mut state = self.append.lock();
        let offset = state.flushed + state.pending.len() as u64;
        state.pending.extend_from_slice(src);
        if state.pending.len() >= APPEND_BUFFER_BYTES {
            self.flush_locked(&mut state)?;
        }
        Ok(offset)
    }

    /// Writes buffered bytes to the file.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.append.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut AppendState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        pwrite_all(&self.file, state.flushed, &state.pending)?;
        state.flushed += state.pending.len() as u64;
        state.pending.clear();
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes buffered bytes and publishes them through a fresh mapping.
    pub fn save_and_remap(&self) -> Result<()> {
        let flushed = {
            let mut state = self.append.lock();
            self.flush_locked(&mut state)?;
            state.flushed
        };
        self.remap_to(flushed)
    }

    fn remap_to(&self, len: u64) -> Result<()> {
        if len == self.mapped_len() && (len == 0 || self.map.read().is_some()) {
            return Ok(());
        }
        let fresh = if len == 0 {
            None
        } else {
            Some(Arc::new(map_read_only(&self.file)?))
        };
        let mut guard = self.map.write();
        *guard = fresh;
        self.mapped_len.store(len, Ordering::Release);
        Ok(())
    }

    /// Borrows `len` bytes at `off` from the current mapping.
    pub fn slice(&self, off: u64, len: usize) -> Result<MappedSlice> {
        let guard = self.map.read();
        let map = guard
            .as_ref()
            .ok_or(IavlError::Corruption("read from unmapped file"))?;
        let start = usize::try_from(off)
            .map_err(|_| IavlError::OutOfRange("file offset exceeds usize"))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= map.len())
            .ok_or(IavlError::Corruption("read beyond mapped file length"))?;
        Ok(MappedSlice {
            map: Arc::clone(map),
            range: start..end,
        })
    }

    /// Copies `dst.len()` bytes at `off`, using the mapping when it covers the
    /// range and a positional read otherwise.
    pub fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let end = off + dst.len() as u64;
        if end <= self.mapped_len() {
            let slice = self.slice(off, dst.len())?;
            dst.copy_from_slice(&slice);
            return Ok(());
        }
        let flushed = self.append.lock().flushed;
        if end > flushed {
            return Err(IavlError::Corruption("read beyond flushed file length"));
        }
        pread_exact(&self.file, off, dst)?;
        Ok(())
    }

    /// Overwrites already-flushed bytes in place.
    pub fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let state = self.append.lock();
        if off + src.len() as u64 > state.flushed {
            return Err(IavlError::Invalid("in-place write beyond flushed length"));
        }
        pwrite_all(&self.file, off, src)?;
        Ok(())
    }

    /// Drops everything at and after `len`; buffered bytes are discarded.
    pub fn truncate(&self, len: u64) -> Result<()> {
        {
            let mut state = self.append.lock();
            state.pending.clear();
            if len >= state.flushed {
                return Ok(());
            }
            // Old mappings may still be referenced; drop ours before shrinking.
            *self.map.write() = None;
            self.mapped_len.store(0, Ordering::Release);
            self.file.set_len(len)?;
            state.flushed = len;
        }
        self.remap_to(len)
    }
}
