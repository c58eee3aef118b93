//! A single persistent tree with its commit worker.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::options::{Options, WalSyncPolicy, NO_EVICTION};
use crate::primitives::wal::{KvUpdate, Wal, WalEntry, WalSyncer, WAL_LOG_FILE};
use crate::storage::{ChangesetIndex, StoreMetrics, TreeStore};
use crate::tree::{
    commit::{commit_traverse, evict, CommitContext},
    empty_hash, NodePointer, Tree,
};
use crate::types::{Hash, IavlError, NodeId, Result};

/// First error hit by the worker; every later call reports a copy.
type ErrorLatch = Arc<Mutex<Option<IavlError>>>;

fn latch(slot: &ErrorLatch, err: IavlError) {
    let mut guard = slot.lock();
    if guard.is_none() {
        *guard = Some(err);
    }
}

/// Committed root and staging bookkeeping of one tree.
pub(crate) struct TreeState {
    root: Option<Arc<NodePointer>>,
    version: u32,
    pending_orphans: Vec<NodeId>,
    last_hash: Hash,
    replaying: bool,
}

/// A version handed to the worker for persistence.
struct CommitRequest {
    version: u32,
    root: Option<Arc<NodePointer>>,
    leaves: u32,
    branches: u32,
    orphans: Vec<NodeId>,
    log_commit: bool,
    /// Signalled once the WAL entry is on disk under the inline policy.
    synced: Option<Sender<()>>,
}

impl TreeState {
    pub(crate) fn version(&self) -> u32 {
        self.version
    }
}

/// Commit traversal result waiting to be published.
pub(crate) struct PreparedCommit {
    version: u32,
    hash: Hash,
    leaves: u32,
    branches: u32,
}

impl PreparedCommit {
    pub(crate) fn hash(&self) -> Hash {
        self.hash
    }
}

enum Job {
    Updates(Vec<KvUpdate>),
    Commit(CommitRequest),
    Barrier(Sender<()>),
}

/// One named tree: the committed root, the staging API and the background
/// worker that persists each commit.
///
/// The caller thread runs mutations and the commit traversal; the worker
/// performs WAL appends, orphan stamping, changeset writes, compaction and
/// eviction in commit order. Once a changeset is sealed, the next logged
/// commit trims the WAL up to the sealed version.
pub struct CommitTree {
    name: String,
    opts: Options,
    state: Mutex<TreeState>,
    index: Arc<ChangesetIndex>,
    saved_version: Arc<AtomicU32>,
    error: ErrorLatch,
    jobs: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommitTree {
    /// Opens the tree stored in `dir` and replays WAL commits that never
    /// reached a changeset.
    pub fn open(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        opts: Options,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Result<Self> {
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        opts.validate()?;
        let store = TreeStore::open(&dir, opts.clone(), Arc::clone(&metrics))?;
        let root = store.latest_root()?;
        let saved = store.saved_version();
        let last_hash = match &root {
            None => empty_hash(),
            Some(root) => root.resolve()?.hash()?,
        };
        let index = Arc::clone(store.index());
        let saved_version = store.saved_version_handle();

        let wal = if opts.write_wal || dir.join(WAL_LOG_FILE).exists() {
            Some(Arc::new(Wal::open(&dir)?))
        } else {
            None
        };
        let error: ErrorLatch = Arc::new(Mutex::new(None));
        let syncer = match (&wal, opts.write_wal, opts.wal_sync_policy()) {
            (Some(wal), true, WalSyncPolicy::Background { buffer }) => {
                let slot = Arc::clone(&error);
                Some(WalSyncer::spawn(Arc::clone(wal), buffer, move |err| {
                    latch(&slot, err)
                })?)
            }
            _ => None,
        };

        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            name: name.clone(),
            store,
            wal: wal.clone().filter(|_| opts.write_wal),
            syncer,
            evict_depth: opts.evict_depth,
            metrics: Arc::clone(&metrics),
            error: Arc::clone(&error),
            wal_trimmed: 0,
        };
        let handle = thread::Builder::new()
            .name(format!("iavlx-{name}"))
            .spawn(move || worker.run(rx))?;

        let tree = Self {
            name,
            opts,
            state: Mutex::new(TreeState {
                root,
                version: saved,
                pending_orphans: Vec::new(),
                last_hash,
                replaying: false,
            }),
            index,
            saved_version,
            error,
            jobs: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        };
        if let Some(wal) = &wal {
            tree.replay(wal, saved, metrics.as_ref())?;
        }
        info!(
            tree = %tree.name,
            dir = %dir.display(),
            version = tree.version(),
            "commit_tree.open"
        );
        Ok(tree)
    }

    fn replay(&self, wal: &Wal, saved: u32, metrics: &dyn StoreMetrics) -> Result<()> {
        let Some(last) = wal.last_commit() else {
            return Ok(());
        };
        if last.version <= u64::from(saved) {
            return Ok(());
        }
        let offset = wal.replay_offset(u64::from(saved))?;
        self.state.lock().replaying = true;
        let mut batch = Vec::new();
        let mut replayed = 0u64;
        let mut versions = 0u32;
        for entry in wal.entries_from(offset)? {
            match entry? {
                WalEntry::Update(update) => batch.push(update),
                WalEntry::Commit(version) if version <= u64::from(saved) => batch.clear(),
                WalEntry::Commit(version) => {
                    let expected = self.version() + 1;
                    if version != u64::from(expected) {
                        return Err(IavlError::CorruptionOwned(format!(
                            "wal commit {version} does not follow version {}",
                            expected - 1
                        )));
                    }
                    let mut tree = self.branch()?;
                    replayed += batch.len() as u64;
                    for update in batch.drain(..) {
                        match update {
                            KvUpdate::Set { key, value } => {
                                tree.set(key, value)?;
                            }
                            KvUpdate::Delete { key } => {
                                tree.remove(&key)?;
                            }
                        }
                    }
                    self.apply(tree)?;
                    self.commit()?;
                    versions += 1;
                }
            }
        }
        self.state.lock().replaying = false;
        metrics.wal_replayed(replayed);
        info!(
            tree = %self.name,
            from = saved + 1,
            versions,
            entries = replayed,
            "commit_tree.wal_replayed"
        );
        self.flush()
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest committed version.
    pub fn version(&self) -> u32 {
        self.state.lock().version
    }

    /// Root hash of the latest committed version.
    pub fn hash(&self) -> Hash {
        self.state.lock().last_hash
    }

    /// Latest version written to changesets; trails [`CommitTree::version`]
    /// while the worker catches up.
    pub fn saved_version(&self) -> u32 {
        self.saved_version.load(Ordering::Acquire)
    }

    /// Changesets of this tree.
    pub fn changesets(&self) -> &Arc<ChangesetIndex> {
        &self.index
    }

    /// Fails with the error the worker latched, if any.
    pub fn check_error(&self) -> Result<()> {
        match &*self.error.lock() {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    /// Stages the next version on top of the current root.
    pub fn branch(&self) -> Result<Tree> {
        self.check_error()?;
        let state = self.state.lock();
        let next = state
            .version
            .checked_add(1)
            .ok_or(IavlError::OutOfRange("tree version exceeds u32"))?;
        Ok(Tree::staged(state.root.clone(), next))
    }

    /// Installs a staged tree as the pending root. The tree must have been
    /// branched from the current root.
    pub fn apply(&self, tree: Tree) -> Result<()> {
        let mut state = self.lock_state();
        self.check_apply(&state, &tree)?;
        self.install(&mut state, tree)
    }

    /// Commits the pending root as the next version and returns its hash.
    /// Persistence continues on the worker; under the inline sync policy
    /// the call returns once the WAL entry is durable.
    pub fn commit(&self) -> Result<Hash> {
        self.check_error()?;
        let (hash, synced) = {
            let mut state = self.lock_state();
            let prepared = self.prepare_commit(&state)?;
            let hash = prepared.hash;
            (hash, self.publish(&mut state, prepared)?)
        };
        self.await_sync(synced)?;
        Ok(hash)
    }

    /// Fails once [`CommitTree::close`] has run.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.jobs.lock().is_none() {
            return Err(IavlError::Closed);
        }
        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock()
    }

    /// Fails unless `tree` can replace the root held in `state`.
    pub(crate) fn check_apply(&self, state: &TreeState, tree: &Tree) -> Result<()> {
        self.check_error()?;
        self.ensure_open()?;
        if tree.is_read_only() {
            return Err(IavlError::Invalid("snapshot trees cannot be applied"));
        }
        let same_root = match (tree.orig_root(), &state.root) {
            (None, None) => true,
            (Some(orig), Some(current)) => Arc::ptr_eq(orig, current),
            _ => false,
        };
        if !same_root || tree.version() != state.version + 1 {
            return Err(IavlError::StaleBranch);
        }
        Ok(())
    }

    /// Makes `tree` the pending root. Call [`CommitTree::check_apply`] first.
    pub(crate) fn install(&self, state: &mut TreeState, tree: Tree) -> Result<()> {
        let (root, orphans, updates) = tree.into_parts();
        state.root = root;
        state.pending_orphans.extend(orphans);
        if self.opts.write_wal && !state.replaying && !updates.is_empty() {
            self.send(Job::Updates(updates))?;
        }
        Ok(())
    }

    /// Assigns ids and hashes the pending root without advancing the
    /// version. Running it again on the same state gives the same result.
    pub(crate) fn prepare_commit(&self, state: &TreeState) -> Result<PreparedCommit> {
        let version = state
            .version
            .checked_add(1)
            .ok_or(IavlError::OutOfRange("tree version exceeds u32"))?;
        let mut ctx = CommitContext::new(version);
        let hash = match &state.root {
            None => empty_hash(),
            Some(root) => commit_traverse(&mut ctx, root)?,
        };
        Ok(PreparedCommit {
            version,
            hash,
            leaves: ctx.leaves(),
            branches: ctx.branches(),
        })
    }

    /// Hands a prepared version to the worker and advances the tree. The
    /// returned receiver fires once the WAL entry is durable.
    pub(crate) fn publish(
        &self,
        state: &mut TreeState,
        prepared: PreparedCommit,
    ) -> Result<Option<Receiver<()>>> {
        let PreparedCommit {
            version,
            hash,
            leaves,
            branches,
        } = prepared;
        let log_commit = self.opts.write_wal && !state.replaying;
        let (synced, ack) = if log_commit && self.opts.wal_sync_policy() == WalSyncPolicy::Inline {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let request = CommitRequest {
            version,
            root: state.root.clone(),
            leaves,
            branches,
            orphans: std::mem::take(&mut state.pending_orphans),
            log_commit,
            synced,
        };
        debug!(
            tree = %self.name,
            version,
            leaves,
            branches,
            orphans = request.orphans.len(),
            "commit_tree.commit"
        );
        self.send(Job::Commit(request))?;
        state.version = version;
        state.last_hash = hash;
        Ok(ack)
    }

    /// Waits for the ack from [`CommitTree::publish`], if there is one.
    pub(crate) fn await_sync(&self, ack: Option<Receiver<()>>) -> Result<()> {
        let Some(ack) = ack else {
            return Ok(());
        };
        if ack.recv().is_err() {
            self.check_error()?;
            return Err(IavlError::Closed);
        }
        Ok(())
    }

    /// Read-only view of a committed version.
    ///
    /// With compaction enabled, versions below the retention window are
    /// rejected since their nodes may already be gone.
    pub fn snapshot(&self, version: u32) -> Result<Tree> {
        self.check_error()?;
        {
            let state = self.state.lock();
            if version == state.version {
                return Ok(Tree::snapshot(state.root.clone(), version));
            }
            if version > state.version {
                return Err(IavlError::InvalidOwned(format!(
                    "version {version} is not committed (latest {})",
                    state.version
                )));
            }
        }
        if version == 0 {
            return Ok(Tree::snapshot(None, 0));
        }
        let saved = self.saved_version();
        if !self.opts.disable_compaction && version < saved.saturating_sub(self.opts.retain_versions) {
            return Err(IavlError::InvalidOwned(format!(
                "version {version} is outside the last {} retained versions",
                self.opts.retain_versions
            )));
        }
        if version > saved {
            // Committed but still queued on the worker.
            self.flush()?;
        }
        Ok(Tree::snapshot(self.index.root_at(version)?, version))
    }

    /// Blocks until the worker has persisted every queued commit.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(Job::Barrier(tx))?;
        rx.recv().map_err(|_| IavlError::Closed)?;
        self.check_error()
    }

    /// Drains the worker, seals the active changeset and stops the worker.
    pub fn close(&self) -> Result<()> {
        let Some(jobs) = self.jobs.lock().take() else {
            return Ok(());
        };
        drop(jobs);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                return Err(IavlError::InvalidOwned(format!(
                    "worker of tree {} panicked",
                    self.name
                )));
            }
        }
        info!(tree = %self.name, version = self.version(), "commit_tree.close");
        self.check_error()
    }

    fn send(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.lock();
        let tx = jobs.as_ref().ok_or(IavlError::Closed)?;
        tx.send(job).map_err(|_| IavlError::Closed)
    }
}

impl Drop for CommitTree {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(tree = %self.name, error = %err, "commit_tree.close_on_drop_failed");
        }
    }
}

struct Worker {
    name: String,
    store: TreeStore,
    wal: Option<Arc<Wal>>,
    syncer: Option<WalSyncer>,
    evict_depth: u8,
    metrics: Arc<dyn StoreMetrics>,
    error: ErrorLatch,
    /// Newest version already dropped from the WAL.
    wal_trimmed: u32,
}

impl Worker {
    fn run(mut self, rx: Receiver<Job>) {
        while let Ok(job) = rx.recv() {
            if let Job::Barrier(done) = job {
                if let Err(err) = self.sync_wal() {
                    self.fail(err);
                }
                let _ = done.send(());
                continue;
            }
            if self.error.lock().is_some() {
                continue;
            }
            let result = match job {
                Job::Updates(updates) => self.log_updates(&updates),
                Job::Commit(request) => self.persist(request),
                Job::Barrier(_) => Ok(()),
            };
            if let Err(err) = result {
                self.fail(err);
            }
        }
        self.shutdown();
    }

    fn fail(&self, err: IavlError) {
        error!(tree = %self.name, error = %err, "commit_tree.worker.failed");
        latch(&self.error, err);
    }

    fn log_updates(&self, updates: &[KvUpdate]) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.append_updates(updates),
            None => Ok(()),
        }
    }

    fn persist(&mut self, request: CommitRequest) -> Result<()> {
        let CommitRequest {
            version,
            root,
            leaves,
            branches,
            orphans,
            log_commit,
            synced,
        } = request;
        if log_commit {
            if let Some(wal) = &self.wal {
                wal.append_commit(u64::from(version))?;
                match &self.syncer {
                    Some(syncer) => syncer.request(u64::from(version))?,
                    None => wal.sync()?,
                }
            }
        }
        if let Some(synced) = synced {
            let _ = synced.send(());
        }
        if !orphans.is_empty() {
            self.store.mark_orphans(version, &orphans)?;
        }
        self.store.save_root(root.as_ref(), version, leaves, branches)?;
        if self.store.maybe_compact()? {
            debug!(tree = %self.name, version, "commit_tree.compacted");
        }
        if let Some(root) = &root {
            if self.evict_depth != NO_EVICTION {
                let evicted = evict(root, 0, self.evict_depth, version);
                self.metrics.nodes_evicted(evicted);
            }
        }
        if log_commit {
            self.trim_wal()?;
        }
        Ok(())
    }

    /// Drops WAL entries of versions that now sit in sealed changesets.
    fn trim_wal(&mut self) -> Result<()> {
        let sealed = self.store.sealed_version();
        if sealed <= self.wal_trimmed {
            return Ok(());
        }
        if let Some(wal) = &self.wal {
            let bytes = wal.trim_through(u64::from(sealed))?;
            debug!(tree = %self.name, through = sealed, bytes, "commit_tree.wal_trimmed");
        }
        self.wal_trimmed = sealed;
        Ok(())
    }

    fn sync_wal(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut syncer) = self.syncer.take() {
            syncer.shutdown();
        }
        if let Err(err) = self.sync_wal().and_then(|_| self.store.close()) {
            self.fail(err);
        }
        debug!(tree = %self.name, "commit_tree.worker.exit");
    }
}
