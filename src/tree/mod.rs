//! The mutable AVL Merkle tree.
//!
//! Nodes are reached through [`NodePointer`]s that hold a resident
//! [`MemNode`], a reference to a persisted record, or both. Mutations copy
//! the touched path into the staged version; commit numbers and hashes the
//! new nodes so the store can write them.

/// Id assignment, hashing and eviction.
pub mod commit;

/// Node hashing.
pub mod hash;

/// In-order range iteration.
pub mod iter;

/// Copy-on-write insert and delete.
pub mod mutation;

/// Resident and persisted nodes.
pub mod node;

#[allow(clippy::module_inception)]
mod tree;

pub use hash::empty_hash;
pub use iter::TreeIter;
pub use node::{MemNode, Node, NodePointer};
pub use tree::Tree;
