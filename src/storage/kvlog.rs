//! Append-only key/value byte log (`kv.dat`).
//!
//! Entries are a little-endian `u32` length followed by the bytes. A leaf
//! writes its key entry immediately followed by its value entry and records
//! the key's offset.

use std::path::Path;

use bytes::Bytes;

use crate::primitives::{bytes::le, io::MmapFile};
use crate::types::{IavlError, Result};

/// Longest key accepted by the store.
pub const MAX_KEY_LEN: usize = (1 << 24) - 1;

const LEN_PREFIX: u64 = 4;

/// The kv log of one changeset.
pub struct KvLog {
    file: MmapFile,
}

impl KvLog {
    /// Opens or creates the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: MmapFile::open(path)?,
        })
    }

    /// Underlying byte file.
    pub fn file(&self) -> &MmapFile {
        &self.file
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.file.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    /// Appends one entry and returns its offset.
    pub fn write_k(&self, key: &[u8]) -> Result<u32> {
        let offset = self.next_offset()?;
        self.append_entry(key)?;
        Ok(offset)
    }

    /// Appends a key entry followed by a value entry; returns the key offset.
    pub fn write_kv(&self, key: &[u8], value: &[u8]) -> Result<u32> {
        let offset = self.next_offset()?;
        self.append_entry(key)?;
        self.append_entry(value)?;
        Ok(offset)
    }

    fn next_offset(&self) -> Result<u32> {
        u32::try_from(self.file.len())
            .map_err(|_| IavlError::OutOfRange("kv log offset exceeds u32"))
    }

    fn append_entry(&self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| IavlError::OutOfRange("kv entry exceeds u32 length"))?;
        let mut entry = Vec::with_capacity(LEN_PREFIX as usize + bytes.len());
        entry.extend_from_slice(&len.to_le_bytes());
        entry.extend_from_slice(bytes);
        self.file.append(&entry)?;
        Ok(())
    }

    /// Reads the entry at `offset`.
    pub fn read_k(&self, offset: u32, zero_copy: bool) -> Result<Bytes> {
        let (bytes, _) = self.read_entry(u64::from(offset), zero_copy)?;
        Ok(bytes)
    }

    /// Reads the key entry at `offset` and the value entry after it.
    pub fn read_kv(&self, offset: u32, zero_copy: bool) -> Result<(Bytes, Bytes)> {
        let (key, next) = self.read_entry(u64::from(offset), zero_copy)?;
        let (value, _) = self.read_entry(next, zero_copy)?;
        Ok((key, value))
    }

    fn read_entry(&self, offset: u64, zero_copy: bool) -> Result<(Bytes, u64)> {
        let prefix = self.file.slice(offset, LEN_PREFIX as usize)?;
        let len = le::get_u32(&prefix, 0) as usize;
        let body = self.file.slice(offset + LEN_PREFIX, len)?;
        let bytes = if zero_copy {
            body.into_bytes()
        } else {
            Bytes::copy_from_slice(&body)
        };
        Ok((bytes, offset + LEN_PREFIX + len as u64))
    }

    /// Flushes and publishes appended entries.
    pub fn save_and_remap(&self) -> Result<()> {
        self.file.save_and_remap()
    }

    /// Flushes and fsyncs.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}
