//! Versioned, persistent authenticated key-value store built on an
//! AVL-balanced Merkle tree.
//!
//! Each named tree keeps its history in append-only changesets of
//! fixed-size node records; a [`Db`] commits all of its trees together and
//! reports an aggregate root hash per version.
//!
//! ```no_run
//! use iavlx::{Db, Options};
//!
//! # fn main() -> iavlx::Result<()> {
//! let db = Db::open("/tmp/iavlx-demo", &["bank"], Options::default())?;
//! let mut staged = db.branch()?;
//! if let Some(bank) = staged.tree_mut("bank") {
//!     bank.set("alice", "10")?;
//! }
//! db.apply(staged)?;
//! let info = db.commit()?;
//! println!("version {} -> {}", info.version, hex::encode(info.hash));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod tree;
pub mod types;

pub use db::{CommitInfo, CommitTree, Db, MultiTree, Options, StoreInfo};
pub use tree::{Tree, TreeIter};
pub use types::{Hash, IavlError, NodeId, NodeRef, Result};
