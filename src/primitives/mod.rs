//! Low-level building blocks shared by the storage engine.
//!
//! Byte encoding helpers, memory-mapped append-only files and the per-tree
//! write-ahead log.

/// Byte-level utilities: fixed-width little-endian fields and varints.
pub mod bytes;

/// Append-only files with a shared read-only memory map.
pub mod io;

/// Write-ahead logging of tree updates for crash recovery.
pub mod wal;
