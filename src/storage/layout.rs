//! Fixed-size on-disk records.
//!
//! Every record is little-endian with naturally aligned fields so that a
//! file of records is a plain array of the struct.

use crate::primitives::{bytes::le, io::Record};
use crate::types::{Hash, NodeId, NodeRef, HASH_LEN};

/// Persisted leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafLayout {
    /// Leaf id assigned at commit.
    pub id: NodeId,
    /// kv-log offset of the key; the value follows it.
    pub key_offset: u32,
    /// Version that orphaned this leaf, 0 while live.
    pub orphan_version: u32,
    /// Merkle hash.
    pub hash: Hash,
}

impl LeafLayout {
    /// Byte offset of `orphan_version` within the record.
    pub const ORPHAN_VERSION_OFFSET: usize = 12;
}

impl Record for LeafLayout {
    const SIZE: usize = 48;

    fn encode(&self, dst: &mut [u8]) {
        le::put_u64(dst, 0, self.id.0);
        le::put_u32(dst, 8, self.key_offset);
        le::put_u32(dst, Self::ORPHAN_VERSION_OFFSET, self.orphan_version);
        dst[16..16 + HASH_LEN].copy_from_slice(&self.hash);
    }

    fn decode(src: &[u8]) -> Self {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&src[16..16 + HASH_LEN]);
        Self {
            id: NodeId(le::get_u64(src, 0)),
            key_offset: le::get_u32(src, 8),
            orphan_version: le::get_u32(src, Self::ORPHAN_VERSION_OFFSET),
            hash,
        }
    }
}

/// Persisted branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchLayout {
    /// Branch id assigned at commit.
    pub id: NodeId,
    /// Left child.
    pub left: NodeRef,
    /// Right child.
    pub right: NodeRef,
    /// kv-log offset of the pivot key.
    pub key_offset: u32,
    /// Reserved, always 0.
    pub key_loc: u8,
    /// Subtree height, at least 1.
    pub height: u8,
    /// Leaves in the subtree.
    pub size: u32,
    /// Version that orphaned this branch, 0 while live.
    pub orphan_version: u32,
    /// Merkle hash.
    pub hash: Hash,
}

impl BranchLayout {
    /// Byte offset of `orphan_version` within the record.
    pub const ORPHAN_VERSION_OFFSET: usize = 36;
}

impl Record for BranchLayout {
    const SIZE: usize = 72;

    fn encode(&self, dst: &mut [u8]) {
        le::put_u64(dst, 0, self.id.0);
        le::put_u64(dst, 8, self.left.0);
        le::put_u64(dst, 16, self.right.0);
        le::put_u32(dst, 24, self.key_offset);
        dst[28] = self.key_loc;
        dst[29] = self.height;
        dst[30] = 0;
        dst[31] = 0;
        le::put_u32(dst, 32, self.size);
        le::put_u32(dst, Self::ORPHAN_VERSION_OFFSET, self.orphan_version);
        dst[40..40 + HASH_LEN].copy_from_slice(&self.hash);
    }

    fn decode(src: &[u8]) -> Self {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&src[40..40 + HASH_LEN]);
        Self {
            id: NodeId(le::get_u64(src, 0)),
            left: NodeRef(le::get_u64(src, 8)),
            right: NodeRef(le::get_u64(src, 16)),
            key_offset: le::get_u32(src, 24),
            key_loc: src[28],
            height: src[29],
            size: le::get_u32(src, 32),
            orphan_version: le::get_u32(src, Self::ORPHAN_VERSION_OFFSET),
            hash,
        }
    }
}

/// Where one version's leaves or branches sit in their file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeSetInfo {
    /// 0-based record position of the first record.
    pub start_offset: u32,
    /// Number of records.
    pub count: u32,
    /// Index of the first record's id, 0 when empty.
    pub start_index: u32,
    /// Index of the last record's id, 0 when empty.
    pub end_index: u32,
}

impl NodeSetInfo {
    fn encode(&self, dst: &mut [u8], off: usize) {
        le::put_u32(dst, off, self.start_offset);
        le::put_u32(dst, off + 4, self.count);
        le::put_u32(dst, off + 8, self.start_index);
        le::put_u32(dst, off + 12, self.end_index);
    }

    fn decode(src: &[u8], off: usize) -> Self {
        Self {
            start_offset: le::get_u32(src, off),
            count: le::get_u32(src, off + 4),
            start_index: le::get_u32(src, off + 8),
            end_index: le::get_u32(src, off + 12),
        }
    }

    /// A dense run of `count` records starting at `start_offset`.
    pub fn dense(start_offset: u32, count: u32) -> Self {
        Self {
            start_offset,
            count,
            start_index: if count == 0 { 0 } else { 1 },
            end_index: count,
        }
    }

    /// Position just past the last record.
    pub fn end_offset(&self) -> u32 {
        self.start_offset + self.count
    }
}

/// Per-version index record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// Leaves written by the version.
    pub leaves: NodeSetInfo,
    /// Branches written by the version.
    pub branches: NodeSetInfo,
    /// Root of the tree at this version, none when empty.
    pub root_id: NodeId,
}

impl Record for VersionInfo {
    const SIZE: usize = 40;

    fn encode(&self, dst: &mut [u8]) {
        self.leaves.encode(dst, 0);
        self.branches.encode(dst, 16);
        le::put_u64(dst, 32, self.root_id.0);
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            leaves: NodeSetInfo::decode(src, 0),
            branches: NodeSetInfo::decode(src, 16),
            root_id: NodeId(le::get_u64(src, 32)),
        }
    }
}

/// Singleton header of a changeset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChangesetInfo {
    /// First version stored.
    pub start_version: u32,
    /// Last version stored.
    pub end_version: u32,
    /// Orphaned leaves still present.
    pub leaf_orphans: u32,
    /// Orphaned branches still present.
    pub branch_orphans: u32,
    /// Sum of orphan versions over orphaned leaves.
    pub leaf_orphan_version_total: u64,
    /// Sum of orphan versions over orphaned branches.
    pub branch_orphan_version_total: u64,
}

impl ChangesetInfo {
    /// Orphaned records of either kind.
    pub fn orphans(&self) -> u64 {
        u64::from(self.leaf_orphans) + u64::from(self.branch_orphans)
    }

    /// Mean orphan version, `None` without orphans.
    pub fn mean_orphan_version(&self) -> Option<f64> {
        let orphans = self.orphans();
        if orphans == 0 {
            return None;
        }
        let total = self.leaf_orphan_version_total + self.branch_orphan_version_total;
        Some(total as f64 / orphans as f64)
    }
}

impl Record for ChangesetInfo {
    const SIZE: usize = 32;

    fn encode(&self, dst: &mut [u8]) {
        le::put_u32(dst, 0, self.start_version);
        le::put_u32(dst, 4, self.end_version);
        le::put_u32(dst, 8, self.leaf_orphans);
        le::put_u32(dst, 12, self.branch_orphans);
        le::put_u64(dst, 16, self.leaf_orphan_version_total);
        le::put_u64(dst, 24, self.branch_orphan_version_total);
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            start_version: le::get_u32(src, 0),
            end_version: le::get_u32(src, 4),
            leaf_orphans: le::get_u32(src, 8),
            branch_orphans: le::get_u32(src, 12),
            leaf_orphan_version_total: le::get_u64(src, 16),
            branch_orphan_version_total: le::get_u64(src, 24),
        }
    }
}
