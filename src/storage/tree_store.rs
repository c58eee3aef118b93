//! Changesets of one tree: opening, saving, orphan stamping and compaction.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use super::{
    changeset::{dir_name, parse_dir_name, Changeset, ChangesetIndex},
    compaction,
    layout::VersionInfo,
    metrics::StoreMetrics,
    writer::ChangesetWriter,
};
use crate::db::options::Options;
use crate::tree::node::NodePointer;
use crate::types::{IavlError, NodeId, Result};

/// Persistence owner for one tree directory.
///
/// All mutating calls come from the tree's background worker; the
/// [`ChangesetIndex`] and saved version are shared with readers.
pub struct TreeStore {
    dir: PathBuf,
    opts: Options,
    index: Arc<ChangesetIndex>,
    writer: Option<ChangesetWriter>,
    saved_version: Arc<AtomicU32>,
    sealed_version: u32,
    metrics: Arc<dyn StoreMetrics>,
    last_compaction: Option<Instant>,
}

impl TreeStore {
    /// Opens `dir`, creating it when missing.
    ///
    /// Leftover compaction output is removed, superseded generations are
    /// deleted, and the newest changeset is repaired in case it was being
    /// written when the process stopped.
    pub fn open(dir: impl AsRef<Path>, opts: Options, metrics: Arc<dyn StoreMetrics>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.ends_with(".tmp") {
                warn!(dir = %path.display(), "tree_store.remove_unfinished_compaction");
                fs::remove_dir_all(&path)?;
                continue;
            }
            if let Some((start, revision)) = parse_dir_name(&name) {
                found.push((start, revision, path));
            }
        }
        found.sort();

        // Highest revision wins for each start version.
        let mut latest: Vec<(u32, u32, PathBuf)> = Vec::with_capacity(found.len());
        for entry in found {
            if let Some(prev) = latest.last() {
                if prev.0 == entry.0 {
                    if let Some((_, _, stale)) = latest.pop() {
                        remove_superseded(&stale)?;
                    }
                }
            }
            latest.push(entry);
        }

        let index = Arc::new(ChangesetIndex::default());
        let mut end: Option<u32> = None;
        let last_pos = latest.len().saturating_sub(1);
        for (pos, (start, _, path)) in latest.into_iter().enumerate() {
            if let Some(end) = end {
                if start <= end {
                    remove_superseded(&path)?;
                    continue;
                }
                if start != end + 1 {
                    return Err(IavlError::CorruptionOwned(format!(
                        "versions {} to {} are missing from {}",
                        end + 1,
                        start - 1,
                        dir.display()
                    )));
                }
            }
            let cs = Changeset::open(&path, opts.zero_copy, Arc::downgrade(&index), pos == last_pos)?;
            if cs.version_count() == 0 {
                warn!(dir = %path.display(), "tree_store.remove_empty_changeset");
                drop(cs);
                fs::remove_dir_all(&path)?;
                continue;
            }
            end = Some(cs.info().end_version);
            index.insert(cs);
        }

        let saved = end.unwrap_or(0);
        info!(
            dir = %dir.display(),
            saved_version = saved,
            changesets = index.changesets().len(),
            "tree_store.open"
        );
        Ok(Self {
            dir,
            opts,
            index,
            writer: None,
            saved_version: Arc::new(AtomicU32::new(saved)),
            sealed_version: saved,
            metrics,
            last_compaction: None,
        })
    }

    /// Tree directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Changesets of this tree.
    pub fn index(&self) -> &Arc<ChangesetIndex> {
        &self.index
    }

    /// Latest version fully written to changesets.
    pub fn saved_version(&self) -> u32 {
        self.saved_version.load(Ordering::Acquire)
    }

    /// Latest version held by a sealed changeset. Everything at or below it
    /// is durable without the WAL.
    pub fn sealed_version(&self) -> u32 {
        self.sealed_version
    }

    /// Shared handle on the saved version.
    pub fn saved_version_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.saved_version)
    }

    /// Root of the latest saved version.
    pub fn latest_root(&self) -> Result<Option<Arc<NodePointer>>> {
        match self.saved_version() {
            0 => Ok(None),
            version => self.index.root_at(version),
        }
    }

    /// Stamps `version` as the orphan version of every id and persists the
    /// changed headers. Returns how many records changed.
    pub fn mark_orphans(&self, version: u32, ids: &[NodeId]) -> Result<u64> {
        let mut touched: Vec<Arc<Changeset>> = Vec::new();
        let mut marked = 0;
        for id in ids {
            let cs = self.index.owner_of(*id)?;
            if cs.mark_orphan(version, *id)? {
                marked += 1;
            }
            if !touched.iter().any(|seen| Arc::ptr_eq(seen, &cs)) {
                touched.push(cs);
            }
        }
        for cs in &touched {
            cs.persist_info()?;
        }
        self.metrics.orphans_marked(marked);
        debug!(version, orphans = ids.len(), marked, "tree_store.mark_orphans");
        Ok(marked)
    }

    /// Saves `version`, starting a new changeset when none is active and
    /// sealing it once it reaches `changeset_max_target`.
    pub fn save_root(
        &mut self,
        root: Option<&Arc<NodePointer>>,
        version: u32,
        leaves: u32,
        branches: u32,
    ) -> Result<VersionInfo> {
        let writer = match &mut self.writer {
            Some(writer) => writer,
            empty => {
                let expected = self.saved_version.load(Ordering::Acquire) + 1;
                if version != expected {
                    return Err(IavlError::VersionMismatch {
                        expected,
                        actual: version,
                    });
                }
                let path = self.dir.join(dir_name(version, 0));
                if path.exists() {
                    warn!(dir = %path.display(), "tree_store.remove_stale_changeset");
                    fs::remove_dir_all(&path)?;
                }
                let writer = ChangesetWriter::create(
                    &path,
                    version,
                    self.opts.zero_copy,
                    Arc::downgrade(&self.index),
                    Arc::clone(&self.metrics),
                )?;
                self.index.insert(Arc::clone(writer.changeset()));
                empty.insert(writer)
            }
        };
        let info = writer.save_root(root, version, leaves, branches)?;
        self.saved_version.store(version, Ordering::Release);

        if writer.total_bytes() >= self.opts.changeset_max_target {
            if let Some(writer) = self.writer.take() {
                writer.seal()?;
                self.sealed_version = version;
            }
        }
        Ok(info)
    }

    /// Compacts when enabled and the minimum interval has passed.
    pub fn maybe_compact(&mut self) -> Result<bool> {
        if self.opts.disable_compaction {
            return Ok(false);
        }
        let interval = Duration::from_secs(u64::from(self.opts.min_compaction_seconds));
        if let Some(last) = self.last_compaction {
            if last.elapsed() < interval {
                return Ok(false);
            }
        }
        self.compact()
    }

    /// Runs one compaction if a changeset qualifies. Returns whether the
    /// changeset set changed.
    pub fn compact(&mut self) -> Result<bool> {
        let saved = self.saved_version();
        let Some(group) = compaction::plan(&self.index.changesets(), saved, &self.opts) else {
            return Ok(false);
        };
        self.last_compaction = Some(Instant::now());
        let bottom = saved.saturating_sub(self.opts.retain_versions);
        let Some((fresh, stats)) = compaction::compact(
            &self.dir,
            &group,
            bottom,
            &self.opts,
            Arc::downgrade(&self.index),
        )?
        else {
            return Ok(false);
        };
        let starts: Vec<u32> = group.iter().map(|cs| cs.start_version()).collect();
        for old in self.index.replace(&starts, fresh) {
            old.retire();
        }
        self.metrics.compacted(group.len(), stats.dropped);
        Ok(true)
    }

    /// Seals the active changeset, if any.
    pub fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.seal()?;
            self.sealed_version = self.saved_version();
        }
        Ok(())
    }
}

fn remove_superseded(path: &Path) -> Result<()> {
    warn!(dir = %path.display(), "tree_store.remove_superseded");
    fs::remove_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::metrics::NoopMetrics;
    use crate::tree::{
        commit::{commit_traverse, CommitContext},
        mutation::{set_recursive, MutationContext},
        node::MemNode,
    };
    use bytes::Bytes;
    use tempfile::tempdir;

    fn open(dir: &Path, opts: Options) -> Result<TreeStore> {
        TreeStore::open(dir, opts, Arc::new(NoopMetrics))
    }

    /// Sets `key` in a fresh version on top of `root` and saves it.
    fn save_set(
        store: &mut TreeStore,
        root: Option<Arc<NodePointer>>,
        version: u32,
        key: &str,
    ) -> Result<(Arc<NodePointer>, Vec<NodeId>)> {
        let key = Bytes::copy_from_slice(key.as_bytes());
        let value = Bytes::from(format!("v{version}"));
        let mut ctx = MutationContext::new(version);
        let root = match root {
            None => NodePointer::from_mem(MemNode::leaf(key, value, version)),
            Some(root) => set_recursive(&mut ctx, &root, &key, &value)?.0,
        };
        let mut commit = CommitContext::new(version);
        commit_traverse(&mut commit, &root)?;
        store.mark_orphans(version, &ctx.orphans)?;
        store.save_root(Some(&root), version, commit.leaves(), commit.branches())?;
        Ok((root, ctx.orphans))
    }

    #[test]
    fn reopen_reads_the_latest_root() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut store = open(dir.path(), Options::default())?;
            let mut root = None;
            for (version, key) in ["a", "b", "c"].iter().enumerate() {
                root = Some(save_set(&mut store, root, version as u32 + 1, key)?.0);
            }
            assert_eq!(store.sealed_version(), 0);
            store.close()?;
            assert_eq!(store.sealed_version(), 3);
        }
        let store = open(dir.path(), Options::default())?;
        assert_eq!(store.saved_version(), 3);
        assert_eq!(store.sealed_version(), 3);
        let root = store.latest_root()?.ok_or(IavlError::Invalid("no root"))?.resolve()?;
        assert_eq!(root.size(), 3);
        assert_eq!(root.get(b"b")?.1, Some(Bytes::from_static(b"v2")));
        Ok(())
    }

    #[test]
    fn changesets_seal_at_the_size_target() -> Result<()> {
        let dir = tempdir()?;
        let opts = Options::default().with_changeset_max_target(1);
        let mut store = open(dir.path(), opts.clone())?;
        let mut root = None;
        for version in 1..=3u32 {
            root = Some(save_set(&mut store, root, version, &format!("k{version}"))?.0);
        }
        let starts: Vec<u32> = store
            .index()
            .changesets()
            .iter()
            .map(|cs| cs.start_version())
            .collect();
        assert_eq!(starts, vec![1, 2, 3]);
        assert_eq!(store.sealed_version(), 3);
        drop(store);

        let store = open(dir.path(), opts)?;
        assert_eq!(store.saved_version(), 3);
        assert_eq!(store.index().root_at(2)?.ok_or(IavlError::Invalid("empty"))?.resolve()?.size(), 2);
        Ok(())
    }

    #[test]
    fn overwrites_stamp_orphans_in_older_changesets() -> Result<()> {
        let dir = tempdir()?;
        let opts = Options::default().with_changeset_max_target(1);
        let mut store = open(dir.path(), opts)?;
        let (root, _) = save_set(&mut store, None, 1, "k")?;
        let (_, orphans) = save_set(&mut store, Some(root), 2, "k")?;
        assert_eq!(orphans, vec![NodeId::new(true, 1, 1)?]);
        let first = store.index().for_version(1).ok_or(IavlError::Invalid("missing"))?;
        assert_eq!(first.leaves().get(0)?.orphan_version, 2);
        assert_eq!(first.info().leaf_orphans, 1);
        Ok(())
    }

    #[test]
    fn compaction_drops_orphans_below_the_retention_bottom() -> Result<()> {
        let dir = tempdir()?;
        let opts = Options::default()
            .with_changeset_max_target(1)
            .with_retain_versions(1)
            .with_min_compaction_seconds(0);
        let mut store = open(dir.path(), opts.clone())?;
        let mut root = None;
        for version in 1..=6u32 {
            root = Some(save_set(&mut store, root, version, "same")?.0);
        }
        // Versions 1..=4 end below the bottom (5) and each is fully orphaned.
        assert!(store.compact()?);
        let compacted = store.index().for_version(1).ok_or(IavlError::Invalid("missing"))?;
        assert_eq!(compacted.revision(), 1);
        assert_eq!(compacted.leaves().count(), 0);
        let live = store.latest_root()?.ok_or(IavlError::Invalid("empty"))?.resolve()?;
        assert_eq!(live.get(b"same")?.1, Some(Bytes::from_static(b"v6")));
        drop(compacted);
        drop(store);

        let store = open(dir.path(), opts)?;
        assert_eq!(store.saved_version(), 6);
        assert!(!dir.path().join("1").exists());
        Ok(())
    }

    #[test]
    fn leftovers_from_an_interrupted_compaction_are_cleaned_up() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut store = open(dir.path(), Options::default())?;
            save_set(&mut store, None, 1, "k")?;
            store.close()?;
        }
        fs::create_dir_all(dir.path().join("1.1.tmp"))?;
        fs::create_dir_all(dir.path().join("2"))?;
        let store = open(dir.path(), Options::default())?;
        assert_eq!(store.saved_version(), 1);
        assert!(!dir.path().join("1.1.tmp").exists());
        assert!(!dir.path().join("2").exists());
        Ok(())
    }
}
