//! One changeset directory: a contiguous run of versions and the nodes they
//! wrote.
//!
//! A changeset is append-only while its writer is active and immutable once
//! sealed, except for the `orphan_version` field of its records, which is
//! stamped in place when a later version replaces the node.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{
    kvlog::KvLog,
    layout::{BranchLayout, ChangesetInfo, LeafLayout, NodeSetInfo, VersionInfo},
};
use crate::primitives::io::{MmapFile, Record, StructFile};
use crate::tree::node::{Node, NodePointer, PersistedBranch, PersistedLeaf};
use crate::types::{IavlError, NodeId, NodeRef, NodeRefKind, Result};

/// Changeset header file.
pub const INFO_FILE: &str = "info.dat";
/// Key/value log file.
pub const KV_FILE: &str = "kv.dat";
/// Leaf record file.
pub const LEAVES_FILE: &str = "leaves.dat";
/// Branch record file.
pub const BRANCHES_FILE: &str = "branches.dat";
/// Per-version index file.
pub const VERSIONS_FILE: &str = "versions.dat";

/// Directory name for a changeset starting at `start_version`; compacted
/// generations carry a `.revision` suffix.
pub fn dir_name(start_version: u32, revision: u32) -> String {
    if revision == 0 {
        start_version.to_string()
    } else {
        format!("{start_version}.{revision}")
    }
}

/// Parses a changeset directory name into `(start_version, revision)`.
pub fn parse_dir_name(name: &str) -> Option<(u32, u32)> {
    match name.split_once('.') {
        None => Some((name.parse().ok()?, 0)),
        Some((start, revision)) => Some((start.parse().ok()?, revision.parse().ok()?)),
    }
}

/// Changesets of one tree keyed by start version.
#[derive(Default)]
pub struct ChangesetIndex {
    map: RwLock<BTreeMap<u32, Arc<Changeset>>>,
}

impl ChangesetIndex {
    /// Changeset whose range can hold `version`: the greatest start at or
    /// below it.
    pub fn for_version(&self, version: u32) -> Option<Arc<Changeset>> {
        self.map
            .read()
            .range(..=version)
            .next_back()
            .map(|(_, cs)| Arc::clone(cs))
    }

    /// All changesets in version order.
    pub fn changesets(&self) -> Vec<Arc<Changeset>> {
        self.map.read().values().cloned().collect()
    }

    pub(crate) fn insert(&self, changeset: Arc<Changeset>) {
        self.map
            .write()
            .insert(changeset.start_version(), changeset);
    }

    /// Swaps `replaced` for `fresh` under one lock and returns the removed
    /// entries.
    pub(crate) fn replace(&self, replaced: &[u32], fresh: Arc<Changeset>) -> Vec<Arc<Changeset>> {
        let mut map = self.map.write();
        let removed = replaced
            .iter()
            .filter_map(|start| map.remove(start))
            .collect();
        map.insert(fresh.start_version(), fresh);
        removed
    }

    /// Pointer to the root saved for `version`, `None` for an empty tree.
    pub fn root_at(&self, version: u32) -> Result<Option<Arc<NodePointer>>> {
        let cs = self
            .for_version(version)
            .ok_or_else(|| IavlError::InvalidOwned(format!("version {version} is not stored")))?;
        let info = cs.version_info(version)?;
        if info.root_id.is_none() {
            return Ok(None);
        }
        let owner = self.owner_of(info.root_id)?;
        Ok(Some(NodePointer::persisted(info.root_id, 0, owner)))
    }

    pub(crate) fn owner_of(&self, id: NodeId) -> Result<Arc<Changeset>> {
        let version = u32::try_from(id.version())
            .map_err(|_| IavlError::Corruption("node version exceeds u32"))?;
        self.for_version(version)
            .ok_or_else(|| IavlError::CorruptionOwned(format!("no changeset holds node {id}")))
    }
}

/// Reader (and, while active, append target) for one changeset directory.
pub struct Changeset {
    dir: PathBuf,
    start_version: u32,
    revision: u32,
    info: Mutex<ChangesetInfo>,
    info_file: MmapFile,
    kv: KvLog,
    leaves: StructFile<LeafLayout>,
    branches: StructFile<BranchLayout>,
    versions: StructFile<VersionInfo>,
    sealed: AtomicBool,
    retired: AtomicBool,
    zero_copy: bool,
    index: Weak<ChangesetIndex>,
}

impl Changeset {
    /// Creates an empty changeset directory for versions from `start_version`.
    pub(crate) fn create(
        dir: &Path,
        start_version: u32,
        revision: u32,
        zero_copy: bool,
        index: Weak<ChangesetIndex>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)?;
        let cs = Self::open_files(dir, start_version, revision, zero_copy, index, false)?;
        if !cs.versions.file().is_empty() || !cs.leaves.file().is_empty() {
            return Err(IavlError::CorruptionOwned(format!(
                "changeset directory {} is not empty",
                dir.display()
            )));
        }
        *cs.info.lock() = ChangesetInfo {
            start_version,
            ..ChangesetInfo::default()
        };
        cs.sealed.store(false, Ordering::Release);
        debug!(dir = %dir.display(), start_version, "changeset.create");
        Ok(Arc::new(cs))
    }

    /// Opens an existing directory. With `repair` a torn tail left by a crash
    /// is cut back to the last complete version; otherwise the files must be
    /// exact.
    pub(crate) fn open(
        dir: &Path,
        zero_copy: bool,
        index: Weak<ChangesetIndex>,
        repair: bool,
    ) -> Result<Arc<Self>> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(IavlError::Invalid("changeset path has no directory name"))?;
        let (start_version, revision) = parse_dir_name(name).ok_or_else(|| {
            IavlError::InvalidOwned(format!("{name} is not a changeset directory name"))
        })?;
        let cs = Self::open_files(dir, start_version, revision, zero_copy, index, repair)?;
        let stored = cs.read_stored_info()?;
        if repair {
            cs.repair_tail()?;
        } else {
            cs.verify(stored)?;
        }
        Ok(Arc::new(cs))
    }

    fn open_files(
        dir: &Path,
        start_version: u32,
        revision: u32,
        zero_copy: bool,
        index: Weak<ChangesetIndex>,
        repair: bool,
    ) -> Result<Self> {
        let (leaves, branches, versions) = if repair {
            (
                StructFile::open_repairing(dir.join(LEAVES_FILE))?,
                StructFile::open_repairing(dir.join(BRANCHES_FILE))?,
                StructFile::open_repairing(dir.join(VERSIONS_FILE))?,
            )
        } else {
            (
                StructFile::open(dir.join(LEAVES_FILE))?,
                StructFile::open(dir.join(BRANCHES_FILE))?,
                StructFile::open(dir.join(VERSIONS_FILE))?,
            )
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            start_version,
            revision,
            info: Mutex::new(ChangesetInfo::default()),
            info_file: MmapFile::open(dir.join(INFO_FILE))?,
            kv: KvLog::open(dir.join(KV_FILE))?,
            leaves,
            branches,
            versions,
            sealed: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            zero_copy,
            index,
        })
    }

    fn read_stored_info(&self) -> Result<Option<ChangesetInfo>> {
        if self.info_file.len() != ChangesetInfo::SIZE as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; ChangesetInfo::SIZE];
        self.info_file.read_at(0, &mut buf)?;
        let info = ChangesetInfo::decode(&buf);
        *self.info.lock() = info;
        Ok(Some(info))
    }

    fn verify(&self, stored: Option<ChangesetInfo>) -> Result<()> {
        let info = stored.ok_or_else(|| self.corrupt("info.dat is missing or truncated"))?;
        let count = self.versions.count();
        if count == 0 {
            return Err(self.corrupt("versions.dat is empty"));
        }
        if info.start_version != self.start_version
            || info.end_version != self.start_version + count - 1
        {
            return Err(self.corrupt("info.dat version range disagrees with versions.dat"));
        }
        let last = self.versions.get(count - 1)?;
        if self.leaves.count() != last.leaves.end_offset()
            || self.branches.count() != last.branches.end_offset()
        {
            return Err(self.corrupt("record counts disagree with the last version"));
        }
        Ok(())
    }

    fn repair_tail(&self) -> Result<()> {
        loop {
            let count = self.versions.count();
            if count == 0 {
                break;
            }
            let version = self.start_version + count - 1;
            let last = self.versions.get(count - 1)?;
            if self.version_records_intact(version, &last)? {
                let (leaves, branches) = (self.leaves.count(), self.branches.count());
                if leaves != last.leaves.end_offset() || branches != last.branches.end_offset() {
                    warn!(
                        dir = %self.dir.display(),
                        version,
                        leaves,
                        branches,
                        "changeset.truncate_unversioned_records"
                    );
                    self.leaves.truncate(last.leaves.end_offset())?;
                    self.branches.truncate(last.branches.end_offset())?;
                }
                break;
            }
            warn!(dir = %self.dir.display(), version, "changeset.drop_torn_version");
            self.versions.truncate(count - 1)?;
        }

        let count = self.versions.count();
        let mut info = self.recount_orphans()?;
        info.start_version = self.start_version;
        info.end_version = if count == 0 {
            0
        } else {
            self.start_version + count - 1
        };
        *self.info.lock() = info;
        self.persist_info()
    }

    fn version_records_intact(&self, version: u32, vi: &VersionInfo) -> Result<bool> {
        if self.leaves.count() < vi.leaves.end_offset()
            || self.branches.count() < vi.branches.end_offset()
        {
            return Ok(false);
        }
        if vi.leaves.count > 0 {
            let last = self.leaves.get(vi.leaves.end_offset() - 1)?;
            if last.id != NodeId::new(true, u64::from(version), vi.leaves.end_index)? {
                return Ok(false);
            }
        }
        if vi.branches.count > 0 {
            let last = self.branches.get(vi.branches.end_offset() - 1)?;
            if last.id != NodeId::new(false, u64::from(version), vi.branches.end_index)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn recount_orphans(&self) -> Result<ChangesetInfo> {
        let mut info = ChangesetInfo::default();
        for pos in 0..self.leaves.mapped_count() {
            let orphan = self.leaves.get(pos)?.orphan_version;
            if orphan != 0 {
                info.leaf_orphans += 1;
                info.leaf_orphan_version_total += u64::from(orphan);
            }
        }
        for pos in 0..self.branches.mapped_count() {
            let orphan = self.branches.get(pos)?.orphan_version;
            if orphan != 0 {
                info.branch_orphans += 1;
                info.branch_orphan_version_total += u64::from(orphan);
            }
        }
        Ok(info)
    }

    fn corrupt(&self, what: &str) -> IavlError {
        IavlError::CorruptionOwned(format!("changeset {}: {what}", self.dir.display()))
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First version stored.
    pub fn start_version(&self) -> u32 {
        self.start_version
    }

    /// Compaction generation, 0 for an original changeset.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Snapshot of the header.
    pub fn info(&self) -> ChangesetInfo {
        *self.info.lock()
    }

    /// Number of versions stored.
    pub fn version_count(&self) -> u32 {
        self.versions.count()
    }

    /// Whether the changeset will receive no more versions.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Whether keys and values are served straight from the mapping.
    pub fn zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// Leaf records.
    pub fn leaves(&self) -> &StructFile<LeafLayout> {
        &self.leaves
    }

    /// Branch records.
    pub fn branches(&self) -> &StructFile<BranchLayout> {
        &self.branches
    }

    /// Version index records.
    pub fn versions(&self) -> &StructFile<VersionInfo> {
        &self.versions
    }

    /// Key/value log.
    pub fn kv(&self) -> &KvLog {
        &self.kv
    }

    /// Bytes across all data files.
    pub fn total_bytes(&self) -> u64 {
        self.kv.len()
            + self.leaves.file().len()
            + self.branches.file().len()
            + self.versions.file().len()
    }

    /// Index record of `version`.
    pub fn version_info(&self, version: u32) -> Result<VersionInfo> {
        let pos = version
            .checked_sub(self.start_version)
            .filter(|pos| *pos < self.versions.mapped_count())
            .ok_or_else(|| {
                IavlError::InvalidOwned(format!(
                    "version {version} is not stored in changeset {}",
                    self.dir.display()
                ))
            })?;
        self.versions.get(pos)
    }

    /// Reads the key entry at `offset`.
    pub fn read_k(&self, offset: u32) -> Result<Bytes> {
        self.kv.read_k(offset, self.zero_copy)
    }

    /// Reads the key and value entries at `offset`.
    pub fn read_kv(&self, offset: u32) -> Result<(Bytes, Bytes)> {
        self.kv.read_kv(offset, self.zero_copy)
    }

    /// Materializes the node `id`; `file_idx == 0` searches by id.
    pub fn resolve(self: &Arc<Self>, id: NodeId, file_idx: u32) -> Result<Node> {
        if id.is_leaf() {
            Ok(Node::Leaf(self.resolve_leaf(id, file_idx)?))
        } else {
            Ok(Node::Branch(self.resolve_branch(id, file_idx)?))
        }
    }

    /// Reads a leaf record and checks its id.
    pub fn resolve_leaf(self: &Arc<Self>, id: NodeId, file_idx: u32) -> Result<PersistedLeaf> {
        let pos = match file_idx {
            0 => self.leaf_position(id)?,
            idx => idx - 1,
        };
        let layout = self.leaves.get(pos)?;
        if layout.id != id {
            return Err(IavlError::CorruptionOwned(format!(
                "leaf record {} of {} holds {} instead of {id}",
                pos + 1,
                self.dir.display(),
                layout.id
            )));
        }
        Ok(PersistedLeaf {
            layout,
            store: Arc::clone(self),
            file_idx: pos + 1,
        })
    }

    /// Reads a branch record and checks its id.
    pub fn resolve_branch(self: &Arc<Self>, id: NodeId, file_idx: u32) -> Result<PersistedBranch> {
        let pos = match file_idx {
            0 => self.branch_position(id)?,
            idx => idx - 1,
        };
        let layout = self.branches.get(pos)?;
        if layout.id != id {
            return Err(IavlError::CorruptionOwned(format!(
                "branch record {} of {} holds {} instead of {id}",
                pos + 1,
                self.dir.display(),
                layout.id
            )));
        }
        Ok(PersistedBranch {
            layout,
            store: Arc::clone(self),
            file_idx: pos + 1,
        })
    }

    /// Turns a child reference of the branch at `self_idx` into a pointer.
    pub fn resolve_node_ref(self: &Arc<Self>, node_ref: NodeRef, self_idx: u32) -> Result<Arc<NodePointer>> {
        match node_ref.decode() {
            NodeRefKind::Id(id) => {
                let index = self.index.upgrade().ok_or(IavlError::Closed)?;
                let owner = index.owner_of(id)?;
                Ok(NodePointer::persisted(id, 0, owner))
            }
            NodeRefKind::Relative { is_leaf, offset } => {
                let file_idx = if is_leaf {
                    offset
                } else {
                    i64::from(self_idx) + offset
                };
                let count = if is_leaf {
                    self.leaves.mapped_count()
                } else {
                    self.branches.mapped_count()
                };
                let file_idx = u32::try_from(file_idx)
                    .ok()
                    .filter(|idx| (1..=count).contains(idx))
                    .ok_or_else(|| {
                        self.corrupt("relative child reference points outside the file")
                    })?;
                let id = if is_leaf {
                    self.leaves.get(file_idx - 1)?.id
                } else {
                    self.branches.get(file_idx - 1)?.id
                };
                Ok(NodePointer::persisted(id, file_idx, Arc::clone(self)))
            }
        }
    }

    fn leaf_position(&self, id: NodeId) -> Result<u32> {
        let vi = self.version_info(node_version(id)?)?;
        find_by_id(&self.leaves, &vi.leaves, id, |rec| rec.id)?
            .ok_or_else(|| self.missing(id))
    }

    fn branch_position(&self, id: NodeId) -> Result<u32> {
        let vi = self.version_info(node_version(id)?)?;
        find_by_id(&self.branches, &vi.branches, id, |rec| rec.id)?
            .ok_or_else(|| self.missing(id))
    }

    fn missing(&self, id: NodeId) -> IavlError {
        IavlError::CorruptionOwned(format!("node {id} not found in {}", self.dir.display()))
    }

    /// Stamps `orphan_version` on the record of `id` unless it already
    /// carries one. Returns whether the record changed.
    pub(crate) fn mark_orphan(&self, version: u32, id: NodeId) -> Result<bool> {
        let stamp = version.to_le_bytes();
        if id.is_leaf() {
            let pos = self.leaf_position(id)?;
            if self.leaves.get(pos)?.orphan_version != 0 {
                return Ok(false);
            }
            self.leaves
                .write_field(pos, LeafLayout::ORPHAN_VERSION_OFFSET, &stamp)?;
            let mut info = self.info.lock();
            info.leaf_orphans += 1;
            info.leaf_orphan_version_total += u64::from(version);
        } else {
            let pos = self.branch_position(id)?;
            if self.branches.get(pos)?.orphan_version != 0 {
                return Ok(false);
            }
            self.branches
                .write_field(pos, BranchLayout::ORPHAN_VERSION_OFFSET, &stamp)?;
            let mut info = self.info.lock();
            info.branch_orphans += 1;
            info.branch_orphan_version_total += u64::from(version);
        }
        Ok(true)
    }

    /// Writes the in-memory header to `info.dat`.
    pub(crate) fn persist_info(&self) -> Result<()> {
        let mut buf = [0u8; ChangesetInfo::SIZE];
        self.info.lock().encode(&mut buf);
        if self.info_file.len() == ChangesetInfo::SIZE as u64 {
            return self.info_file.write_at(0, &buf);
        }
        self.info_file.truncate(0)?;
        self.info_file.append(&buf)?;
        self.info_file.flush()
    }

    pub(crate) fn set_info(&self, info: ChangesetInfo) {
        *self.info.lock() = info;
    }

    /// Appends the index record of `version` and publishes every file.
    pub(crate) fn finish_version(&self, version: u32, vi: &VersionInfo) -> Result<()> {
        self.versions.append(vi)?;
        self.kv.save_and_remap()?;
        self.leaves.save_and_remap()?;
        self.branches.save_and_remap()?;
        self.versions.save_and_remap()?;
        self.info.lock().end_version = version;
        self.persist_info()
    }

    /// Fsyncs every file and stops accepting versions.
    pub(crate) fn seal(&self) -> Result<()> {
        self.kv.sync()?;
        self.leaves.sync()?;
        self.branches.sync()?;
        self.versions.sync()?;
        self.persist_info()?;
        self.info_file.sync()?;
        self.sealed.store(true, Ordering::Release);
        let info = self.info();
        info!(
            dir = %self.dir.display(),
            start_version = info.start_version,
            end_version = info.end_version,
            bytes = self.total_bytes(),
            "changeset.seal"
        );
        Ok(())
    }

    /// Deletes the directory once the last handle is dropped.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for Changeset {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "changeset.removed"),
            Err(err) => warn!(dir = %self.dir.display(), error = %err, "changeset.remove_failed"),
        }
    }
}

fn node_version(id: NodeId) -> Result<u32> {
    u32::try_from(id.version()).map_err(|_| IavlError::Corruption("node version exceeds u32"))
}

/// Interpolation search for `id` over the records `set` covers. Indices grow
/// strictly with position, so a span whose index range equals its position
/// range is dense and the target position is computed directly.
fn find_by_id<T: Record>(
    file: &StructFile<T>,
    set: &NodeSetInfo,
    id: NodeId,
    id_of: impl Fn(&T) -> NodeId,
) -> Result<Option<u32>> {
    if set.count == 0 {
        return Ok(None);
    }
    let target = i64::from(id.index());
    let mut low = i64::from(set.start_offset);
    let mut high = low + i64::from(set.count) - 1;
    let mut low_idx = i64::from(set.start_index);
    let mut high_idx = i64::from(set.end_index);

    while low <= high {
        if target < low_idx || target > high_idx {
            return Ok(None);
        }
        let mid = if high_idx - low_idx == high - low {
            low + (target - low_idx)
        } else if high_idx == low_idx {
            low + (high - low) / 2
        } else {
            let frac = (target - low_idx) as f64 / (high_idx - low_idx) as f64;
            (low + (frac * (high - low) as f64) as i64).clamp(low, high)
        };
        let rec_id = id_of(&file.get(mid as u32)?);
        if rec_id.version() != id.version() {
            return Err(IavlError::CorruptionOwned(format!(
                "record {rec_id} found in the range of version {}",
                id.version()
            )));
        }
        let mid_idx = i64::from(rec_id.index());
        match mid_idx.cmp(&target) {
            std::cmp::Ordering::Equal => return Ok(Some(mid as u32)),
            std::cmp::Ordering::Less => {
                low = mid + 1;
                low_idx = mid_idx + 1;
            }
            std::cmp::Ordering::Greater => {
                high = mid - 1;
                high_idx = mid_idx - 1;
            }
        }
    }
    Ok(None)
}
