use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks invoked by the persistence pipeline.
///
/// Every method is called from a tree's background worker, except
/// [`StoreMetrics::wal_replayed`], which runs while a tree is opening.
pub trait StoreMetrics: Send + Sync {
    /// A version was saved with the given number of new leaves and branches.
    fn version_saved(&self, leaves: u32, branches: u32);

    /// Bytes appended to a kv log.
    fn kv_bytes_written(&self, bytes: u64);

    /// Records stamped with an orphan version.
    fn orphans_marked(&self, count: u64);

    /// A changeset stopped accepting versions.
    fn changeset_sealed(&self);

    /// A compaction replaced `sources` changesets, dropping `dropped` records.
    fn compacted(&self, sources: usize, dropped: u64);

    /// Resident nodes released after a save.
    fn nodes_evicted(&self, count: u64);

    /// WAL entries re-applied while opening.
    fn wal_replayed(&self, entries: u64);
}

/// A [`StoreMetrics`] that records nothing.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn version_saved(&self, _leaves: u32, _branches: u32) {}
    fn kv_bytes_written(&self, _bytes: u64) {}
    fn orphans_marked(&self, _count: u64) {}
    fn changeset_sealed(&self) {}
    fn compacted(&self, _sources: usize, _dropped: u64) {}
    fn nodes_evicted(&self, _count: u64) {}
    fn wal_replayed(&self, _entries: u64) {}
}

/// Atomic counters for every [`StoreMetrics`] hook.
#[derive(Default)]
pub struct CounterMetrics {
    /// Versions saved.
    pub versions_saved: AtomicU64,

    /// Leaf records written.
    pub leaves_written: AtomicU64,

    /// Branch records written.
    pub branches_written: AtomicU64,

    /// Bytes appended to kv logs.
    pub kv_bytes: AtomicU64,

    /// Records stamped as orphaned.
    pub orphans_marked: AtomicU64,

    /// Changesets sealed.
    pub changesets_sealed: AtomicU64,

    /// Compactions completed.
    pub compactions: AtomicU64,

    /// Records dropped by compaction.
    pub records_dropped: AtomicU64,

    /// Resident nodes evicted.
    pub nodes_evicted: AtomicU64,

    /// WAL entries replayed on open.
    pub wal_entries_replayed: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn version_saved(&self, leaves: u32, branches: u32) {
        self.versions_saved.fetch_add(1, Ordering::Relaxed);
        self.leaves_written
            .fetch_add(u64::from(leaves), Ordering::Relaxed);
        self.branches_written
            .fetch_add(u64::from(branches), Ordering::Relaxed);
    }

    fn kv_bytes_written(&self, bytes: u64) {
        self.kv_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn orphans_marked(&self, count: u64) {
        self.orphans_marked.fetch_add(count, Ordering::Relaxed);
    }

    fn changeset_sealed(&self) {
        self.changesets_sealed.fetch_add(1, Ordering::Relaxed);
    }

    fn compacted(&self, _sources: usize, dropped: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.records_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    fn nodes_evicted(&self, count: u64) {
        self.nodes_evicted.fetch_add(count, Ordering::Relaxed);
    }

    fn wal_replayed(&self, entries: u64) {
        self.wal_entries_replayed
            .fetch_add(entries, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
