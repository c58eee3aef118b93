//! Rewrites sealed changesets without the records no retained version can
//! reach.
//!
//! A record survives when it is live (`orphan_version == 0`) or was orphaned
//! at or after the retention bottom. A branch that survives only ever points
//! at surviving children: a child is orphaned no earlier than any parent
//! that references it, because replacing the child copies the whole path
//! above it.

use std::{
    fs,
    path::Path,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::{
    changeset::{dir_name, Changeset, ChangesetIndex, KV_FILE},
    layout::{ChangesetInfo, NodeSetInfo, VersionInfo},
};
use crate::db::options::Options;
use crate::primitives::io::sync_dir;
use crate::types::{IavlError, NodeRef, NodeRefKind, Result};

/// Outcome of one compaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records copied into the new changeset.
    pub kept: u64,
    /// Records left behind.
    pub dropped: u64,
}

/// Whether `cs` has accumulated enough dead weight to rewrite.
pub fn should_compact(cs: &Changeset, retain_bottom: u32, opts: &Options) -> bool {
    let info = cs.info();
    let orphans = info.orphans();
    if orphans == 0 {
        return false;
    }
    let total = u64::from(cs.leaves().count()) + u64::from(cs.branches().count());
    if total > 0 && orphans as f64 / total as f64 >= opts.compaction_orphan_ratio {
        return true;
    }
    let age_target = f64::from(retain_bottom) - opts.compaction_orphan_age;
    match info.mean_orphan_version() {
        Some(mean) if age_target > 0.0 => mean <= age_target,
        _ => false,
    }
}

/// Picks the next run of changesets to compact, oldest first.
///
/// Only sealed changesets that end below the retention bottom are
/// candidates. With `compact_wal`, sealed neighbours are joined onto a
/// candidate while the combined size stays within `changeset_max_target`.
pub fn plan(changesets: &[Arc<Changeset>], saved_version: u32, opts: &Options) -> Option<Vec<Arc<Changeset>>> {
    let bottom = saved_version.saturating_sub(opts.retain_versions);
    for (i, cs) in changesets.iter().enumerate() {
        if !cs.is_sealed() || cs.info().end_version >= bottom {
            continue;
        }
        let mut group = vec![Arc::clone(cs)];
        if opts.compact_wal {
            let mut bytes = cs.total_bytes();
            for next in &changesets[i + 1..] {
                if !next.is_sealed() || bytes + next.total_bytes() > opts.changeset_max_target {
                    break;
                }
                bytes += next.total_bytes();
                group.push(Arc::clone(next));
            }
        }
        if group.len() > 1 || should_compact(cs, bottom, opts) {
            return Some(group);
        }
    }
    None
}

/// Writes the surviving records of `sources` into a new changeset in
/// `tree_dir` and opens it. Returns `None` when a single source would be
/// copied unchanged.
pub fn compact(
    tree_dir: &Path,
    sources: &[Arc<Changeset>],
    retain_bottom: u32,
    opts: &Options,
    index: Weak<ChangesetIndex>,
) -> Result<Option<(Arc<Changeset>, CompactionStats)>> {
    let (Some(first), Some(last)) = (sources.first(), sources.last()) else {
        return Ok(None);
    };
    if !opts.compact_wal && sources.len() > 1 {
        return Err(IavlError::Invalid(
            "joining changesets requires rewriting the kv log",
        ));
    }
    let start_version = first.start_version();
    let revision = sources.iter().map(|cs| cs.revision()).max().unwrap_or(0) + 1;
    let name = dir_name(start_version, revision);
    let final_dir = tree_dir.join(&name);
    let tmp_dir = tree_dir.join(format!("{name}.tmp"));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;
    if !opts.compact_wal {
        fs::hard_link(first.dir().join(KV_FILE), tmp_dir.join(KV_FILE))?;
    }

    let out = Changeset::create(&tmp_dir, start_version, revision, opts.zero_copy, Weak::new())?;
    let mut copier = Copier {
        out: &out,
        retain_bottom,
        rewrite_kv: opts.compact_wal,
        key_offsets: FxHashMap::default(),
        info: ChangesetInfo {
            start_version,
            end_version: last.info().end_version,
            ..ChangesetInfo::default()
        },
        stats: CompactionStats::default(),
    };
    for src in sources {
        copier.copy_changeset(src)?;
    }
    let Copier { info, stats, .. } = copier;

    if sources.len() == 1 && stats.dropped == 0 {
        drop(out);
        fs::remove_dir_all(&tmp_dir)?;
        debug!(dir = %first.dir().display(), "compaction.nothing_to_drop");
        return Ok(None);
    }

    out.set_info(info);
    out.seal()?;
    drop(out);
    fs::rename(&tmp_dir, &final_dir)?;
    sync_dir(tree_dir)?;

    let fresh = Changeset::open(&final_dir, opts.zero_copy, index, false)?;
    info!(
        dir = %final_dir.display(),
        sources = sources.len(),
        kept = stats.kept,
        dropped = stats.dropped,
        "compaction.done"
    );
    Ok(Some((fresh, stats)))
}

struct Copier<'a> {
    out: &'a Changeset,
    retain_bottom: u32,
    rewrite_kv: bool,
    key_offsets: FxHashMap<Bytes, u32>,
    info: ChangesetInfo,
    stats: CompactionStats,
}

/// Old 1-based file index to new 1-based file index, per source changeset.
#[derive(Default)]
struct Remap {
    leaves: FxHashMap<u32, u32>,
    branches: FxHashMap<u32, u32>,
}

impl Copier<'_> {
    fn retained(&self, orphan_version: u32) -> bool {
        orphan_version == 0 || orphan_version >= self.retain_bottom
    }

    fn copy_changeset(&mut self, src: &Changeset) -> Result<()> {
        let mut remap = Remap::default();
        let end = src.info().end_version;
        for version in src.start_version()..=end {
            let vi = src.version_info(version)?;
            let leaves = self.copy_leaves(src, &vi.leaves, &mut remap)?;
            let branches = self.copy_branches(src, &vi.branches, &mut remap)?;
            self.out.versions().append(&VersionInfo {
                leaves,
                branches,
                root_id: vi.root_id,
            })?;
        }
        Ok(())
    }

    fn copy_leaves(&mut self, src: &Changeset, set: &NodeSetInfo, remap: &mut Remap) -> Result<NodeSetInfo> {
        let mut copied = NodeSetInfo {
            start_offset: self.out.leaves().count(),
            ..NodeSetInfo::default()
        };
        for pos in set.start_offset..set.end_offset() {
            let mut leaf = src.leaves().get(pos)?;
            if !self.retained(leaf.orphan_version) {
                self.stats.dropped += 1;
                continue;
            }
            if self.rewrite_kv {
                let (key, value) = src.read_kv(leaf.key_offset)?;
                leaf.key_offset = self.out.kv().write_kv(&key, &value)?;
                self.key_offsets.insert(key, leaf.key_offset);
            }
            let new_idx = self.out.leaves().append(&leaf)?;
            remap.leaves.insert(pos + 1, new_idx);
            if leaf.orphan_version != 0 {
                self.info.leaf_orphans += 1;
                self.info.leaf_orphan_version_total += u64::from(leaf.orphan_version);
            }
            track(&mut copied, leaf.id.index());
            self.stats.kept += 1;
        }
        Ok(copied)
    }

    fn copy_branches(&mut self, src: &Changeset, set: &NodeSetInfo, remap: &mut Remap) -> Result<NodeSetInfo> {
        let mut copied = NodeSetInfo {
            start_offset: self.out.branches().count(),
            ..NodeSetInfo::default()
        };
        for pos in set.start_offset..set.end_offset() {
            let mut branch = src.branches().get(pos)?;
            if !self.retained(branch.orphan_version) {
                self.stats.dropped += 1;
                continue;
            }
            let old_idx = pos + 1;
            let new_idx = self.out.branches().count() + 1;
            branch.left = remap_ref(branch.left, old_idx, new_idx, remap)?;
            branch.right = remap_ref(branch.right, old_idx, new_idx, remap)?;
            if self.rewrite_kv {
                let key = src.read_k(branch.key_offset)?;
                branch.key_offset = match self.key_offsets.get(&key) {
                    Some(offset) => *offset,
                    None => {
                        let offset = self.out.kv().write_k(&key)?;
                        self.key_offsets.insert(key, offset);
                        offset
                    }
                };
            }
            self.out.branches().append(&branch)?;
            remap.branches.insert(old_idx, new_idx);
            if branch.orphan_version != 0 {
                self.info.branch_orphans += 1;
                self.info.branch_orphan_version_total += u64::from(branch.orphan_version);
            }
            track(&mut copied, branch.id.index());
            self.stats.kept += 1;
        }
        Ok(copied)
    }
}

fn track(set: &mut NodeSetInfo, index: u32) {
    if set.count == 0 {
        set.start_index = index;
    }
    set.end_index = index;
    set.count += 1;
}

fn remap_ref(node_ref: NodeRef, old_parent: u32, new_parent: u32, remap: &Remap) -> Result<NodeRef> {
    match node_ref.decode() {
        NodeRefKind::Id(_) => Ok(node_ref),
        NodeRefKind::Relative { is_leaf: true, offset } => {
            let new_idx = u32::try_from(offset)
                .ok()
                .and_then(|old| remap.leaves.get(&old))
                .ok_or(IavlError::Corruption("retained branch points at a dropped leaf"))?;
            NodeRef::relative(true, i64::from(*new_idx))
        }
        NodeRefKind::Relative { is_leaf: false, offset } => {
            let new_idx = u32::try_from(i64::from(old_parent) + offset)
                .ok()
                .and_then(|old| remap.branches.get(&old))
                .ok_or(IavlError::Corruption("retained branch points at a dropped branch"))?;
            NodeRef::relative(false, i64::from(*new_idx) - i64::from(new_parent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_refs_are_recomputed_from_both_new_positions() -> Result<()> {
        let mut remap = Remap::default();
        remap.leaves.insert(7, 2);
        remap.branches.insert(3, 1);
        // Parent moved from 5 to 2, child from 3 to 1.
        let child = NodeRef::relative(false, -2)?;
        assert_eq!(
            remap_ref(child, 5, 2, &remap)?.decode(),
            NodeRefKind::Relative {
                is_leaf: false,
                offset: -1
            }
        );
        let leaf = NodeRef::relative(true, 7)?;
        assert_eq!(
            remap_ref(leaf, 5, 2, &remap)?.decode(),
            NodeRefKind::Relative {
                is_leaf: true,
                offset: 2
            }
        );
        assert!(remap_ref(NodeRef::relative(true, 8)?, 5, 2, &remap).is_err());
        Ok(())
    }

    #[test]
    fn sparse_index_ranges_are_tracked() {
        let mut set = NodeSetInfo::default();
        for idx in [3, 4, 9] {
            track(&mut set, idx);
        }
        assert_eq!((set.count, set.start_index, set.end_index), (3, 3, 9));
    }
}
