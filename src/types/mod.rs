//! Shared identifiers and the crate error type.
#![forbid(unsafe_code)]

pub mod ids;

pub use ids::{NodeId, NodeRef, NodeRefKind};

/// Length of a SHA-256 digest.
pub const HASH_LEN: usize = 32;

/// A SHA-256 digest.
pub type Hash = [u8; HASH_LEN];

/// Errors surfaced by the store.
#[derive(thiserror::Error, Debug)]
pub enum IavlError {
    /// Underlying file, mmap, or sync failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state disagrees with itself.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// On-disk state disagrees with itself (dynamic detail).
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an unusable argument (dynamic detail).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A value does not fit the field that has to hold it.
    #[error("out of range: {0}")]
    OutOfRange(&'static str),
    /// A changeset writer was handed a version it did not expect.
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version the writer was prepared to save.
        expected: u32,
        /// Version it was asked to save.
        actual: u32,
    },
    /// `apply` was given a tree branched from a root that is no longer current.
    #[error("stale branch: tree was branched from an outdated root")]
    StaleBranch,
    /// The tree or database has been closed.
    #[error("store closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IavlError>;

impl IavlError {
    /// Produces an equivalent error value; `io::Error` is not `Clone`, so the
    /// kind and message are carried over.
    pub fn duplicate(&self) -> IavlError {
        match self {
            IavlError::Io(err) => {
                IavlError::Io(std::io::Error::new(err.kind(), err.to_string()))
            }
            IavlError::Corruption(msg) => IavlError::Corruption(msg),
            IavlError::CorruptionOwned(msg) => IavlError::CorruptionOwned(msg.clone()),
            IavlError::Invalid(msg) => IavlError::Invalid(msg),
            IavlError::InvalidOwned(msg) => IavlError::InvalidOwned(msg.clone()),
            IavlError::OutOfRange(msg) => IavlError::OutOfRange(msg),
            IavlError::VersionMismatch { expected, actual } => IavlError::VersionMismatch {
                expected: *expected,
                actual: *actual,
            },
            IavlError::StaleBranch => IavlError::StaleBranch,
            IavlError::Closed => IavlError::Closed,
        }
    }
}
