//! Copy-on-write AVL insert and delete.
//!
//! Every node on a mutated path is copied into a fresh [`MemNode`] of the
//! staged version; the replaced node's id, when it has one, is recorded as an
//! orphan so the commit can stamp it.

use std::{cmp::Ordering, sync::Arc};

use bytes::Bytes;

use super::node::{MemNode, Node, NodePointer};
use crate::types::{IavlError, NodeId, Result};

/// Staged version plus the ids replaced while mutating it.
#[derive(Debug, Default)]
pub struct MutationContext {
    /// Version every new node is created with.
    pub version: u32,
    /// Ids of committed nodes replaced so far.
    pub orphans: Vec<NodeId>,
}

impl MutationContext {
    /// Context for staging `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            orphans: Vec::new(),
        }
    }

    fn orphan(&mut self, ptr: &NodePointer) {
        let id = ptr.id();
        if !id.is_none() {
            self.orphans.push(id);
        }
    }

    fn new_leaf(&self, key: &Bytes, value: &Bytes) -> Arc<NodePointer> {
        NodePointer::from_mem(MemNode::leaf(key.clone(), value.clone(), self.version))
    }

    /// Copies the branch behind `ptr` into the staged version.
    fn mutate_branch(&mut self, ptr: &NodePointer, node: &Node) -> Result<MemNode> {
        if node.is_leaf() {
            return Err(IavlError::Invalid("cannot copy a leaf as a branch"));
        }
        self.orphan(ptr);
        Ok(MemNode {
            height: node.height(),
            size: node.size(),
            version: self.version,
            key: node.key()?,
            value: None,
            hash: Default::default(),
            left: Some(node.left()?),
            right: Some(node.right()?),
        })
    }
}

/// Inserts or updates `key` below `ptr`. Returns the new subtree and whether
/// an existing key was updated, in which case no shape changed.
pub fn set_recursive(
    ctx: &mut MutationContext,
    ptr: &Arc<NodePointer>,
    key: &Bytes,
    value: &Bytes,
) -> Result<(Arc<NodePointer>, bool)> {
    let node = ptr.resolve()?;
    if node.is_leaf() {
        let leaf_key = node.key()?;
        return Ok(match key[..].cmp(&leaf_key[..]) {
            Ordering::Equal => {
                ctx.orphan(ptr);
                (ctx.new_leaf(key, value), true)
            }
            Ordering::Less => {
                let branch = MemNode::branch(leaf_key, ctx.new_leaf(key, value), Arc::clone(ptr), ctx.version);
                (NodePointer::from_mem(branch), false)
            }
            Ordering::Greater => {
                let branch = MemNode::branch(key.clone(), Arc::clone(ptr), ctx.new_leaf(key, value), ctx.version);
                (NodePointer::from_mem(branch), false)
            }
        });
    }

    let mut copy = ctx.mutate_branch(ptr, &node)?;
    let updated = if key[..] < copy.key[..] {
        let left = Arc::clone(copy.left_ptr()?);
        let (child, updated) = set_recursive(ctx, &left, key, value)?;
        copy.left = Some(child);
        updated
    } else {
        let right = Arc::clone(copy.right_ptr()?);
        let (child, updated) = set_recursive(ctx, &right, key, value)?;
        copy.right = Some(child);
        updated
    };
    if !updated {
        copy.update_height_size()?;
        copy = rebalance(ctx, copy)?;
    }
    Ok((NodePointer::from_mem(copy), updated))
}

/// Result of [`remove_recursive`].
pub struct Removal {
    /// Value of the removed key; `None` when the key was absent.
    pub value: Option<Bytes>,
    /// Replacement subtree; `None` when the subtree became empty.
    pub node: Option<Arc<NodePointer>>,
    /// New minimum key of the subtree when it changed.
    pub new_key: Option<Bytes>,
}

/// Deletes `key` below `ptr`.
pub fn remove_recursive(
    ctx: &mut MutationContext,
    ptr: &Arc<NodePointer>,
    key: &[u8],
) -> Result<Removal> {
    let unchanged = || Removal {
        value: None,
        node: Some(Arc::clone(ptr)),
        new_key: None,
    };
    let node = ptr.resolve()?;
    if node.is_leaf() {
        let (leaf_key, value) = node.key_value()?;
        if leaf_key[..] != *key {
            return Ok(unchanged());
        }
        ctx.orphan(ptr);
        return Ok(Removal {
            value: Some(value),
            node: None,
            new_key: None,
        });
    }

    let pivot = node.key()?;
    if key < &pivot[..] {
        let removal = remove_recursive(ctx, &node.left()?, key)?;
        if removal.value.is_none() {
            return Ok(unchanged());
        }
        let Some(new_left) = removal.node else {
            // The right sibling takes our place and its minimum is our pivot.
            ctx.orphan(ptr);
            return Ok(Removal {
                value: removal.value,
                node: Some(node.right()?),
                new_key: Some(pivot),
            });
        };
        let mut copy = ctx.mutate_branch(ptr, &node)?;
        copy.left = Some(new_left);
        copy.update_height_size()?;
        let copy = rebalance(ctx, copy)?;
        return Ok(Removal {
            value: removal.value,
            node: Some(NodePointer::from_mem(copy)),
            new_key: removal.new_key,
        });
    }

    let removal = remove_recursive(ctx, &node.right()?, key)?;
    if removal.value.is_none() {
        return Ok(unchanged());
    }
    let Some(new_right) = removal.node else {
        ctx.orphan(ptr);
        return Ok(Removal {
            value: removal.value,
            node: Some(node.left()?),
            new_key: None,
        });
    };
    let mut copy = ctx.mutate_branch(ptr, &node)?;
    copy.right = Some(new_right);
    if let Some(new_key) = removal.new_key {
        copy.key = new_key;
    }
    copy.update_height_size()?;
    let copy = rebalance(ctx, copy)?;
    Ok(Removal {
        value: removal.value,
        node: Some(NodePointer::from_mem(copy)),
        new_key: None,
    })
}

/// Restores the AVL property of a freshly copied branch.
fn rebalance(ctx: &mut MutationContext, mut node: MemNode) -> Result<MemNode> {
    let balance = node.balance()?;
    if balance.abs() > 2 {
        return Err(IavlError::OutOfRange("branch balance outside -2..=2"));
    }
    if balance > 1 {
        let left_ptr = Arc::clone(node.left_ptr()?);
        let left = left_ptr.resolve()?;
        if left.balance()? < 0 {
            let copy = ctx.mutate_branch(&left_ptr, &left)?;
            node.left = Some(NodePointer::from_mem(rotate_left(ctx, copy)?));
        }
        return rotate_right(ctx, node);
    }
    if balance < -1 {
        let right_ptr = Arc::clone(node.right_ptr()?);
        let right = right_ptr.resolve()?;
        if right.balance()? > 0 {
            let copy = ctx.mutate_branch(&right_ptr, &right)?;
            node.right = Some(NodePointer::from_mem(rotate_right(ctx, copy)?));
        }
        return rotate_left(ctx, node);
    }
    Ok(node)
}

fn rotate_right(ctx: &mut MutationContext, mut node: MemNode) -> Result<MemNode> {
    let left_ptr = Arc::clone(node.left_ptr()?);
    let left = left_ptr.resolve()?;
    let mut new_self = ctx.mutate_branch(&left_ptr, &left)?;
    node.left = new_self.right.take();
    node.update_height_size()?;
    new_self.right = Some(NodePointer::from_mem(node));
    new_self.update_height_size()?;
    Ok(new_self)
}

fn rotate_left(ctx: &mut MutationContext, mut node: MemNode) -> Result<MemNode> {
    let right_ptr = Arc::clone(node.right_ptr()?);
    let right = right_ptr.resolve()?;
    let mut new_self = ctx.mutate_branch(&right_ptr, &right)?;
    node.right = new_self.left.take();
    node.update_height_size()?;
    new_self.left = Some(NodePointer::from_mem(node));
    new_self.update_height_size()?;
    Ok(new_self)
}
