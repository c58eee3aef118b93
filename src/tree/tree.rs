use std::sync::Arc;

use bytes::Bytes;

use super::{
    hash::empty_hash,
    iter::TreeIter,
    mutation::{remove_recursive, set_recursive, MutationContext},
    node::{MemNode, NodePointer},
};
use crate::primitives::wal::KvUpdate;
use crate::storage::MAX_KEY_LEN;
use crate::types::{Hash, IavlError, NodeId, Result};

/// A working copy of one tree.
///
/// Trees handed out by `CommitTree::branch` stage the next version: updates
/// build new resident nodes on top of the committed root and are recorded for
/// the WAL until the tree is applied. Snapshots are read-only views of a
/// committed version.
pub struct Tree {
    orig_root: Option<Arc<NodePointer>>,
    root: Option<Arc<NodePointer>>,
    ctx: MutationContext,
    updates: Vec<KvUpdate>,
    read_only: bool,
}

impl Tree {
    pub(crate) fn staged(root: Option<Arc<NodePointer>>, version: u32) -> Self {
        Self {
            orig_root: root.clone(),
            root,
            ctx: MutationContext::new(version),
            updates: Vec::new(),
            read_only: false,
        }
    }

    pub(crate) fn snapshot(root: Option<Arc<NodePointer>>, version: u32) -> Self {
        Self {
            read_only: true,
            ..Self::staged(root, version)
        }
    }

    /// Version this tree stages, or the committed version a snapshot shows.
    pub fn version(&self) -> u32 {
        self.ctx.version
    }

    /// True for snapshots.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Inserts or overwrites `key`. Returns true when the key already existed.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<bool> {
        self.check_writable()?;
        let (key, value) = (key.into(), value.into());
        if key.len() > MAX_KEY_LEN {
            return Err(IavlError::OutOfRange("key length must be below 2^24"));
        }
        let updated = match &self.root {
            None => {
                self.root = Some(NodePointer::from_mem(MemNode::leaf(
                    key.clone(),
                    value.clone(),
                    self.ctx.version,
                )));
                false
            }
            Some(root) => {
                let (root, updated) = set_recursive(&mut self.ctx, root, &key, &value)?;
                self.root = Some(root);
                updated
            }
        };
        self.updates.push(KvUpdate::Set { key, value });
        Ok(updated)
    }

    /// Removes `key`, returning its value. Removing an absent key changes
    /// nothing and logs nothing.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_writable()?;
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let removal = remove_recursive(&mut self.ctx, root, key)?;
        if removal.value.is_none() {
            return Ok(None);
        }
        self.root = removal.node;
        self.updates.push(KvUpdate::Delete {
            key: Bytes::copy_from_slice(key),
        });
        Ok(removal.value)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.get_with_index(key)?.1)
    }

    /// In-order position of `key` (where it would be inserted when absent)
    /// and its value.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(i64, Option<Bytes>)> {
        match &self.root {
            None => Ok((0, None)),
            Some(root) => root.resolve()?.get(key),
        }
    }

    /// True when `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of keys.
    pub fn size(&self) -> Result<i64> {
        match &self.root {
            None => Ok(0),
            Some(root) => Ok(root.resolve()?.size()),
        }
    }

    /// Height of the root; 0 for empty and single-leaf trees.
    pub fn height(&self) -> Result<u8> {
        match &self.root {
            None => Ok(0),
            Some(root) => Ok(root.resolve()?.height()),
        }
    }

    /// True when the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Root hash of a committed tree. Fails while staged changes are pending.
    pub fn root_hash(&self) -> Result<Hash> {
        match &self.root {
            None => Ok(empty_hash()),
            Some(root) => root.resolve()?.hash(),
        }
    }

    /// Iterates `[start, end)` in key order, or in reverse when `ascending`
    /// is false. `None` bounds are open.
    pub fn iter(&self, start: Option<&[u8]>, end: Option<&[u8]>, ascending: bool) -> Result<TreeIter> {
        let root = match &self.root {
            None => None,
            Some(root) => Some(root.resolve()?),
        };
        Ok(TreeIter::new(
            root,
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            ascending,
        ))
    }

    /// Updates recorded since the tree was branched.
    pub fn updates(&self) -> &[KvUpdate] {
        &self.updates
    }

    /// Committed nodes replaced so far.
    pub fn orphans(&self) -> &[NodeId] {
        &self.ctx.orphans
    }

    /// Current root, if the tree holds any key.
    pub fn root(&self) -> Option<&Arc<NodePointer>> {
        self.root.as_ref()
    }

    pub(crate) fn orig_root(&self) -> Option<&Arc<NodePointer>> {
        self.orig_root.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Option<Arc<NodePointer>>, Vec<NodeId>, Vec<KvUpdate>) {
        (self.root, self.ctx.orphans, self.updates)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(IavlError::Invalid("snapshot trees are read-only"));
        }
        Ok(())
    }
}
