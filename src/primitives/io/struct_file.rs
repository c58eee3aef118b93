use std::{marker::PhantomData, path::Path};

use tracing::warn;

use super::MmapFile;
use crate::types::{IavlError, Result};

/// A fixed-size little-endian record.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Writes the record into `dst`, which is exactly `SIZE` bytes.
    fn encode(&self, dst: &mut [u8]);

    /// Reads a record from `src`, which is exactly `SIZE` bytes.
    fn decode(src: &[u8]) -> Self;
}

/// Typed view of an [`MmapFile`] holding an array of `T`.
///
/// Positions are 0-based record numbers; [`StructFile::append`] reports the
/// 1-based file index used by node pointers.
pub struct StructFile<T: Record> {
    file: MmapFile,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> StructFile<T> {
    /// Opens a record file that must hold a whole number of records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = MmapFile::open(path)?;
        if file.len() % T::SIZE as u64 != 0 {
            return Err(IavlError::CorruptionOwned(format!(
                "{} is not a multiple of {} bytes",
                file.path().display(),
                T::SIZE
            )));
        }
        Ok(Self {
            file,
            _marker: PhantomData,
        })
    }

    /// Opens a record file, dropping a partial trailing record if present.
    pub fn open_repairing(path: impl AsRef<Path>) -> Result<Self> {
        let file = MmapFile::open(path)?;
        let len = file.len();
        let whole = len - len % T::SIZE as u64;
        if whole != len {
            warn!(
                path = %file.path().display(),
                len,
                kept = whole,
                "struct_file.drop_partial_record"
            );
            file.truncate(whole)?;
        }
        Ok(Self {
            file,
            _marker: PhantomData,
        })
    }

    /// Underlying byte file.
    pub fn file(&self) -> &MmapFile {
        &self.file
    }

    /// Records written so far, including buffered ones.
    pub fn count(&self) -> u32 {
        (self.file.len() / T::SIZE as u64) as u32
    }

    /// Records visible through the mapping.
    pub fn mapped_count(&self) -> u32 {
        (self.file.mapped_len() / T::SIZE as u64) as u32
    }

    /// Appends a record and returns its 1-based file index.
    pub fn append(&self, rec: &T) -> Result<u32> {
        let mut buf = vec![0u8; T::SIZE];
        rec.encode(&mut buf);
        let off = self.file.append(&buf)?;
        let pos = off / T::SIZE as u64;
        u32::try_from(pos + 1).map_err(|_| IavlError::OutOfRange("record count exceeds u32"))
    }

    /// Reads the record at 0-based `pos` from the mapping.
    pub fn get(&self, pos: u32) -> Result<T> {
        if pos >= self.mapped_count() {
            return Err(IavlError::Corruption("record position beyond mapped records"));
        }
        let slice = self
            .file
            .slice(u64::from(pos) * T::SIZE as u64, T::SIZE)?;
        Ok(T::decode(&slice))
    }

    /// Overwrites `bytes` at `field_off` inside the record at `pos`.
    pub fn write_field(&self, pos: u32, field_off: usize, bytes: &[u8]) -> Result<()> {
        debug_assert!(field_off + bytes.len() <= T::SIZE);
        let off = u64::from(pos) * T::SIZE as u64 + field_off as u64;
        self.file.write_at(off, bytes)
    }

    /// Drops every record at and after position `count`.
    pub fn truncate(&self, count: u32) -> Result<()> {
        self.file.truncate(u64::from(count) * T::SIZE as u64)
    }

    /// Flushes and publishes appended records.
    pub fn save_and_remap(&self) -> Result<()> {
        self.file.save_and_remap()
    }

    /// Flushes and fsyncs.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::bytes::le;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq)]
    struct Pair(u32, u64);

    impl Record for Pair {
        const SIZE: usize = 12;

        fn encode(&self, dst: &mut [u8]) {
            le::put_u32(dst, 0, self.0);
            le::put_u64(dst, 4, self.1);
        }

        fn decode(src: &[u8]) -> Self {
            Pair(le::get_u32(src, 0), le::get_u64(src, 4))
        }
    }

    #[test]
    fn append_returns_one_based_index() -> Result<()> {
        let dir = tempdir()?;
        let file = StructFile::<Pair>::open(dir.path().join("pairs.dat"))?;
        assert_eq!(file.append(&Pair(1, 10))?, 1);
        assert_eq!(file.append(&Pair(2, 20))?, 2);
        assert_eq!(file.count(), 2);
        assert_eq!(file.mapped_count(), 0);
        file.save_and_remap()?;
        assert_eq!(file.get(1)?, Pair(2, 20));
        assert!(file.get(2).is_err());

        file.write_field(0, 4, &99u64.to_le_bytes())?;
        assert_eq!(file.get(0)?, Pair(1, 99));
        Ok(())
    }

    #[test]
    fn misaligned_file_is_rejected_or_repaired() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("pairs.dat");
        std::fs::write(&path, [0u8; 30])?;
        assert!(matches!(
            StructFile::<Pair>::open(&path),
            Err(IavlError::CorruptionOwned(_))
        ));
        let repaired = StructFile::<Pair>::open_repairing(&path)?;
        assert_eq!(repaired.count(), 2);
        assert_eq!(std::fs::metadata(&path)?.len(), 24);
        Ok(())
    }
}
