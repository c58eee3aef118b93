//! Multi-tree database: named trees committed together.

/// A single tree with its commit worker.
pub mod commit_tree;

/// Staged multi-trees and commit results.
pub mod multi;

/// Database options.
pub mod options;

use std::{
    collections::HashSet,
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{info, warn};

use commit_tree::TreeState;
pub use commit_tree::CommitTree;
pub use multi::{aggregate_hash, CommitInfo, MultiTree, StoreInfo};
pub use options::{Options, WalSyncPolicy, NO_EVICTION};

use crate::storage::{default_metrics, StoreMetrics};
use crate::types::{IavlError, Result};

/// A set of named trees that advance one version at a time.
///
/// Each tree lives in its own subdirectory and has its own worker; `commit`
/// hashes all trees in parallel on a pool sized to the number of trees.
pub struct Db {
    dir: PathBuf,
    names: Arc<[String]>,
    trees: Vec<CommitTree>,
    pool: rayon::ThreadPool,
    commit_lock: Mutex<()>,
}

impl Db {
    /// Opens (or creates) the database in `dir` with one tree per name.
    pub fn open(dir: impl AsRef<Path>, names: &[&str], opts: Options) -> Result<Self> {
        Self::open_with_metrics(dir, names, opts, default_metrics())
    }

    /// Like [`Db::open`], reporting store activity to `metrics`.
    pub fn open_with_metrics(
        dir: impl AsRef<Path>,
        names: &[&str],
        opts: Options,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        opts.validate()?;
        let mut sorted = validate_names(names)?;
        sorted.sort();
        fs::create_dir_all(&dir)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(sorted.len())
            .thread_name(|i| format!("iavlx-commit-{i}"))
            .build()
            .map_err(|err| IavlError::InvalidOwned(format!("commit pool: {err}")))?;
        let trees = pool.install(|| {
            sorted
                .par_iter()
                .map(|name| CommitTree::open(name.as_str(), dir.join(name), opts.clone(), Arc::clone(&metrics)))
                .collect::<Result<Vec<_>>>()
        })?;

        let version = trees.first().map_or(0, CommitTree::version);
        if let Some(odd) = trees.iter().find(|tree| tree.version() != version) {
            return Err(IavlError::CorruptionOwned(format!(
                "tree {} is at version {} but {} is at {}",
                odd.name(),
                odd.version(),
                sorted[0],
                version
            )));
        }
        info!(dir = %dir.display(), trees = trees.len(), version, "db.open");
        Ok(Self {
            dir,
            names: sorted.into(),
            trees,
            pool,
            commit_lock: Mutex::new(()),
        })
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tree names in name order.
    pub fn tree_names(&self) -> &[String] {
        &self.names
    }

    /// Tree called `name`.
    pub fn tree(&self, name: &str) -> Option<&CommitTree> {
        let pos = self.names.binary_search_by(|candidate| candidate.as_str().cmp(name)).ok()?;
        self.trees.get(pos)
    }

    /// Latest committed version.
    pub fn latest_version(&self) -> u32 {
        self.trees.first().map_or(0, CommitTree::version)
    }

    /// Stages the next version of every tree.
    pub fn branch(&self) -> Result<MultiTree> {
        let trees = self
            .trees
            .iter()
            .map(CommitTree::branch)
            .collect::<Result<Vec<_>>>()?;
        Ok(MultiTree {
            version: self.latest_version() + 1,
            names: Arc::clone(&self.names),
            trees,
        })
    }

    /// Read-only views of every tree at `version`.
    pub fn snapshot(&self, version: u32) -> Result<MultiTree> {
        let trees = self
            .trees
            .iter()
            .map(|tree| tree.snapshot(version))
            .collect::<Result<Vec<_>>>()?;
        Ok(MultiTree {
            version,
            names: Arc::clone(&self.names),
            trees,
        })
    }

    /// Installs every staged tree of `multi`, or none of them: all trees are
    /// locked and checked before the first one changes.
    pub fn apply(&self, multi: MultiTree) -> Result<()> {
        if multi.trees.len() != self.trees.len() || multi.names[..] != self.names[..] {
            return Err(IavlError::InvalidOwned(format!(
                "expected {} trees, got {}",
                self.trees.len(),
                multi.trees.len()
            )));
        }
        let _guard = self.commit_lock.lock();
        let mut states: Vec<_> = self.trees.iter().map(CommitTree::lock_state).collect();
        for ((tree, state), staged) in self.trees.iter().zip(&states).zip(&multi.trees) {
            tree.check_apply(state, staged).map_err(|err| {
                warn!(tree = %tree.name(), error = %err, "db.apply_rejected");
                err
            })?;
        }
        for ((tree, state), staged) in self.trees.iter().zip(states.iter_mut()).zip(multi.trees) {
            tree.install(state, staged)?;
        }
        Ok(())
    }

    /// Commits every tree at the next version.
    ///
    /// Hashing runs on the pool with every tree locked; no tree advances
    /// until all of them have hashed.
    pub fn commit(&self) -> Result<CommitInfo> {
        let _guard = self.commit_lock.lock();
        let mut states: Vec<_> = self.trees.iter().map(CommitTree::lock_state).collect();
        let version = states.first().map_or(0, |state| state.version());
        for (tree, state) in self.trees.iter().zip(&states) {
            tree.check_error()?;
            tree.ensure_open()?;
            if state.version() != version {
                return Err(IavlError::CorruptionOwned(format!(
                    "tree {} is at version {} but {} is at {version}",
                    tree.name(),
                    state.version(),
                    self.names[0]
                )));
            }
        }
        let prepared = {
            let shared: Vec<&TreeState> = states.iter().map(|state| &**state).collect();
            self.pool.install(|| {
                self.trees
                    .par_iter()
                    .zip(shared.into_par_iter())
                    .map(|(tree, state)| tree.prepare_commit(state))
                    .collect::<Result<Vec<_>>>()
            })?
        };
        let mut hashes = Vec::with_capacity(prepared.len());
        let mut acks = Vec::with_capacity(prepared.len());
        for ((tree, state), prepared) in self.trees.iter().zip(states.iter_mut()).zip(prepared) {
            hashes.push(prepared.hash());
            acks.push(tree.publish(state, prepared)?);
        }
        drop(states);
        for (tree, ack) in self.trees.iter().zip(acks) {
            tree.await_sync(ack)?;
        }
        let version = version + 1;
        let stores = self
            .names
            .iter()
            .zip(hashes)
            .map(|(name, hash)| StoreInfo {
                name: name.clone(),
                hash,
                version,
            })
            .collect();
        Ok(CommitInfo::new(version, stores))
    }

    /// Waits until every tree has persisted its queued commits.
    pub fn flush(&self) -> Result<()> {
        self.pool
            .install(|| self.trees.par_iter().try_for_each(CommitTree::flush))
    }

    /// Stops every worker after draining its queue. The first error wins.
    pub fn close(&self) -> Result<()> {
        let mut first = None;
        for tree in &self.trees {
            if let Err(err) = tree.close() {
                first.get_or_insert(err);
            }
        }
        info!(dir = %self.dir.display(), version = self.latest_version(), "db.close");
        first.map_or(Ok(()), Err)
    }
}

fn validate_names(names: &[&str]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(IavlError::Invalid("a database needs at least one tree"));
    }
    let mut seen = HashSet::new();
    for name in names {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(part)), None) if part == *name
        );
        if name.is_empty() || !plain {
            return Err(IavlError::InvalidOwned(format!("invalid tree name {name:?}")));
        }
        if !seen.insert(*name) {
            return Err(IavlError::InvalidOwned(format!("duplicate tree name {name:?}")));
        }
    }
    Ok(names.iter().map(|name| name.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tree_names_are_checked() -> Result<()> {
        assert!(validate_names(&[]).is_err());
        assert!(validate_names(&[""]).is_err());
        assert!(validate_names(&["a", "a"]).is_err());
        assert!(validate_names(&["../up"]).is_err());
        assert!(validate_names(&["a/b"]).is_err());
        assert!(validate_names(&["."]).is_err());
        assert_eq!(validate_names(&["bank", "acc"])?, vec!["bank", "acc"]);
        Ok(())
    }

    #[test]
    fn commit_returns_sorted_store_infos() -> Result<()> {
        let dir = tempdir()?;
        let db = Db::open(dir.path(), &["bank", "acc"], Options::default())?;
        assert_eq!(db.tree_names(), ["acc".to_string(), "bank".to_string()]);
        let mut multi = db.branch()?;
        multi
            .tree_mut("bank")
            .ok_or(IavlError::Invalid("missing tree"))?
            .set("alice", "10")?;
        db.apply(multi)?;
        let info = db.commit()?;
        assert_eq!(info.version, 1);
        assert_eq!(info.stores[0].name, "acc");
        assert_eq!(info.stores[0].hash, crate::tree::empty_hash());
        assert_eq!(info.hash, aggregate_hash(&info.stores));
        assert_eq!(db.latest_version(), 1);
        db.close()?;
        Ok(())
    }

    #[test]
    fn apply_rejects_foreign_multi_trees() -> Result<()> {
        let dir = tempdir()?;
        let one = Db::open(dir.path().join("one"), &["a"], Options::default())?;
        let two = Db::open(dir.path().join("two"), &["a", "b"], Options::default())?;
        let staged = two.branch()?;
        assert!(one.apply(staged).is_err());
        Ok(())
    }
}
