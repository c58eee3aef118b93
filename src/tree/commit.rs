//! Id assignment and hashing of a staged version, plus eviction after save.

use std::sync::Arc;

use super::{
    hash::{branch_hash, leaf_hash},
    node::NodePointer,
};
use crate::types::{Hash, IavlError, NodeId, Result};

/// Counters of one commit traversal.
#[derive(Debug)]
pub struct CommitContext {
    version: u32,
    leaves: u32,
    branches: u32,
}

impl CommitContext {
    /// Traversal state for staging `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            leaves: 0,
            branches: 0,
        }
    }

    /// Leaves that received an id.
    pub fn leaves(&self) -> u32 {
        self.leaves
    }

    /// Branches that received an id.
    pub fn branches(&self) -> u32 {
        self.branches
    }
}

/// Assigns ids to the nodes of the staged version below `ptr` and returns
/// the subtree hash.
///
/// Leaves are numbered as they are reached and branches once both children
/// are done, which is the order the writer appends them in.
pub fn commit_traverse(ctx: &mut CommitContext, ptr: &Arc<NodePointer>) -> Result<Hash> {
    let Some(mem) = ptr.mem() else {
        return ptr.resolve()?.hash();
    };
    if mem.version() != ctx.version {
        return mem
            .hash()
            .ok_or(IavlError::Corruption("committed node is missing its hash"));
    }

    let hash = if mem.is_leaf() {
        ctx.leaves += 1;
        ptr.set_id(NodeId::new(true, u64::from(ctx.version), ctx.leaves)?);
        let value = mem
            .value
            .as_ref()
            .ok_or(IavlError::Corruption("leaf without value"))?;
        leaf_hash(ctx.version, mem.key(), value)
    } else {
        let left = commit_traverse(ctx, mem.left_ptr()?)?;
        let right = commit_traverse(ctx, mem.right_ptr()?)?;
        ctx.branches += 1;
        ptr.set_id(NodeId::new(false, u64::from(ctx.version), ctx.branches)?);
        branch_hash(mem.height, mem.size, ctx.version, &left, &right)
    };
    Ok(*mem.hash.get_or_init(|| hash))
}

/// Drops resident nodes at depth `evict_depth` or deeper once they are
/// persisted. Returns how many nodes were released.
pub fn evict(ptr: &Arc<NodePointer>, depth: u8, evict_depth: u8, saved_version: u32) -> u64 {
    let Some(mem) = ptr.mem() else {
        return 0;
    };
    if mem.version() > saved_version {
        return 0;
    }
    let mut evicted = 0;
    if depth >= evict_depth && ptr.evict() {
        evicted += 1;
    }
    if let (Some(left), Some(right)) = (&mem.left, &mem.right) {
        let next = depth.saturating_add(1);
        evicted += evict(left, next, evict_depth, saved_version);
        evicted += evict(right, next, evict_depth, saved_version);
    }
    evicted
}
