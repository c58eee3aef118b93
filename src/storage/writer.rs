//! Appends committed versions to the active changeset.

use std::{
    path::Path,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::{
    changeset::{Changeset, ChangesetIndex},
    layout::{BranchLayout, LeafLayout, NodeSetInfo, VersionInfo},
    metrics::StoreMetrics,
};
use crate::tree::node::NodePointer;
use crate::types::{IavlError, NodeId, NodeRef, Result};

/// Writer for the one changeset of a tree that still accepts versions.
pub struct ChangesetWriter {
    changeset: Arc<Changeset>,
    key_offsets: FxHashMap<Bytes, u32>,
    next_version: u32,
    metrics: Arc<dyn StoreMetrics>,
}

struct SaveCounts {
    version: u32,
    leaves: u32,
    branches: u32,
}

impl ChangesetWriter {
    /// Creates the changeset directory `dir` for versions from `start_version`.
    pub fn create(
        dir: &Path,
        start_version: u32,
        zero_copy: bool,
        index: Weak<ChangesetIndex>,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Result<Self> {
        let changeset = Changeset::create(dir, start_version, 0, zero_copy, index)?;
        Ok(Self {
            changeset,
            key_offsets: FxHashMap::default(),
            next_version: start_version,
            metrics,
        })
    }

    /// Changeset being written.
    pub fn changeset(&self) -> &Arc<Changeset> {
        &self.changeset
    }

    /// Version the next [`ChangesetWriter::save_root`] must carry.
    pub fn next_version(&self) -> u32 {
        self.next_version
    }

    /// Bytes written across the changeset's data files.
    pub fn total_bytes(&self) -> u64 {
        self.changeset.total_bytes()
    }

    /// Writes every node of `version` reachable from `root` in post order,
    /// then the version's index record.
    ///
    /// `total_leaves` and `total_branches` are the counts the commit
    /// traversal assigned; a different number of written records means the
    /// tree changed underneath the writer.
    pub fn save_root(
        &mut self,
        root: Option<&Arc<NodePointer>>,
        version: u32,
        total_leaves: u32,
        total_branches: u32,
    ) -> Result<VersionInfo> {
        if version != self.next_version {
            return Err(IavlError::VersionMismatch {
                expected: self.next_version,
                actual: version,
            });
        }
        let leaves_start = self.changeset.leaves().count();
        let branches_start = self.changeset.branches().count();
        let kv_start = self.changeset.kv().len();

        let mut counts = SaveCounts {
            version,
            leaves: 0,
            branches: 0,
        };
        let root_id = match root {
            Some(root) => {
                self.write_node(root, &mut counts)?;
                root.id()
            }
            None => NodeId::NONE,
        };
        if counts.leaves != total_leaves || counts.branches != total_branches {
            return Err(IavlError::CorruptionOwned(format!(
                "version {version} wrote {} leaves and {} branches, expected {total_leaves} and {total_branches}",
                counts.leaves, counts.branches
            )));
        }

        let info = VersionInfo {
            leaves: NodeSetInfo::dense(leaves_start, counts.leaves),
            branches: NodeSetInfo::dense(branches_start, counts.branches),
            root_id,
        };
        self.changeset.finish_version(version, &info)?;
        self.next_version += 1;

        self.metrics.version_saved(counts.leaves, counts.branches);
        self.metrics
            .kv_bytes_written(self.changeset.kv().len() - kv_start);
        debug!(
            version,
            leaves = counts.leaves,
            branches = counts.branches,
            root = %root_id,
            "changeset.save_root"
        );
        Ok(info)
    }

    fn write_node(&mut self, ptr: &Arc<NodePointer>, counts: &mut SaveCounts) -> Result<()> {
        let Some(mem) = ptr.mem() else {
            return Ok(());
        };
        if mem.version() != counts.version {
            return Ok(());
        }
        let hash = mem
            .hash()
            .ok_or(IavlError::Invalid("node saved before its hash was computed"))?;

        if mem.is_leaf() {
            let value = mem
                .value
                .as_ref()
                .ok_or(IavlError::Corruption("leaf without value"))?;
            let key_offset = self.changeset.kv().write_kv(mem.key(), value)?;
            self.key_offsets.insert(mem.key().clone(), key_offset);
            let file_idx = self.changeset.leaves().append(&LeafLayout {
                id: ptr.id(),
                key_offset,
                orphan_version: 0,
                hash,
            })?;
            counts.leaves += 1;
            ptr.mark_persisted(file_idx, &self.changeset);
            return Ok(());
        }

        let left = mem.left_ptr()?;
        let right = mem.right_ptr()?;
        self.write_node(left, counts)?;
        self.write_node(right, counts)?;

        let parent_idx = self.changeset.branches().count() + 1;
        let left_ref = child_ref(left, parent_idx, counts.version)?;
        let right_ref = child_ref(right, parent_idx, counts.version)?;
        let key_offset = match self.key_offsets.get(mem.key()) {
            Some(offset) => *offset,
            None => {
                let offset = self.changeset.kv().write_k(mem.key())?;
                self.key_offsets.insert(mem.key().clone(), offset);
                offset
            }
        };
        let size = u32::try_from(mem.size)
            .map_err(|_| IavlError::OutOfRange("branch size exceeds u32"))?;
        let file_idx = self.changeset.branches().append(&BranchLayout {
            id: ptr.id(),
            left: left_ref,
            right: right_ref,
            key_offset,
            key_loc: 0,
            height: mem.height,
            size,
            orphan_version: 0,
            hash,
        })?;
        debug_assert_eq!(file_idx, parent_idx);
        counts.branches += 1;
        ptr.mark_persisted(file_idx, &self.changeset);
        Ok(())
    }

    /// Fsyncs the changeset and hands it over as read-only.
    pub fn seal(self) -> Result<Arc<Changeset>> {
        self.changeset.seal()?;
        self.metrics.changeset_sealed();
        Ok(self.changeset)
    }
}

/// Children written in the same version are addressed relative to the
/// parent; anything older is addressed by id.
fn child_ref(child: &NodePointer, parent_idx: u32, version: u32) -> Result<NodeRef> {
    let id = child.id();
    if id.is_none() {
        return Err(IavlError::Corruption("child has no id when its parent is saved"));
    }
    if id.version() != u64::from(version) {
        return Ok(NodeRef::from_id(id));
    }
    let file_idx = i64::from(child.file_idx());
    if id.is_leaf() {
        NodeRef::relative(true, file_idx)
    } else {
        NodeRef::relative(false, file_idx - i64::from(parent_idx))
    }
}
