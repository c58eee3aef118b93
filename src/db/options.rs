use serde::{Deserialize, Serialize};

use crate::types::{IavlError, Result};

/// Eviction depth that keeps every node resident.
pub const NO_EVICTION: u8 = u8::MAX;

/// How commits wait for the WAL to reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncPolicy {
    /// Every commit returns only after its WAL entry is fsynced.
    Inline,
    /// Fsync on a background thread; commits block only once `buffer`
    /// unsynced commits are queued.
    Background {
        /// Commits allowed in flight.
        buffer: usize,
    },
}

/// Tuning knobs shared by every tree of a database.
///
/// Missing fields take their defaults when loaded from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Serve keys and values straight from the memory map instead of copying.
    pub zero_copy: bool,
    /// Depth at and below which persisted nodes are dropped from memory
    /// after each save; 255 disables eviction.
    pub evict_depth: u8,
    /// Log every update to the WAL before it is committed.
    pub write_wal: bool,
    /// -1 syncs the WAL inside each commit; 0 or more syncs in the
    /// background with that many commits buffered (0 behaves like 1).
    pub wal_sync_buffer: i32,
    /// Rewrite the kv log during compaction, dropping dead entries, and allow
    /// adjacent changesets to be joined.
    pub compact_wal: bool,
    /// Never compact changesets.
    pub disable_compaction: bool,
    /// Orphaned share of a changeset's records that triggers compaction.
    pub compaction_orphan_ratio: f64,
    /// Compact once the mean orphan version is this many versions below the
    /// retention bottom.
    pub compaction_orphan_age: f64,
    /// Most recent versions that stay readable through snapshots.
    pub retain_versions: u32,
    /// Minimum seconds between two compactions of one tree.
    pub min_compaction_seconds: u32,
    /// Size in bytes at which the active changeset is sealed.
    pub changeset_max_target: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            zero_copy: false,
            evict_depth: NO_EVICTION,
            write_wal: true,
            wal_sync_buffer: -1,
            compact_wal: true,
            disable_compaction: false,
            compaction_orphan_ratio: 0.6,
            compaction_orphan_age: 10.0,
            retain_versions: 100,
            min_compaction_seconds: 60,
            changeset_max_target: 128 * 1024 * 1024,
        }
    }
}

impl Options {
    /// Fsync per commit, keep everything resident.
    pub fn durable() -> Self {
        Self::default()
    }

    /// Background WAL sync, zero-copy reads and eviction below depth 16.
    pub fn throughput() -> Self {
        Self {
            zero_copy: true,
            evict_depth: 16,
            wal_sync_buffer: 64,
            ..Self::default()
        }
    }

    /// Parses options from TOML.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: Self =
            toml::from_str(src).map_err(|err| IavlError::InvalidOwned(format!("options: {err}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Parses options from JSON.
    pub fn from_json_str(src: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(src)
            .map_err(|err| IavlError::InvalidOwned(format!("options: {err}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Rejects combinations the store cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.compaction_orphan_ratio) {
            return Err(IavlError::Invalid(
                "compaction_orphan_ratio must be within 0..=1",
            ));
        }
        if !self.compaction_orphan_age.is_finite() || self.compaction_orphan_age < 0.0 {
            return Err(IavlError::Invalid(
                "compaction_orphan_age must be a non-negative number",
            ));
        }
        if self.changeset_max_target == 0 {
            return Err(IavlError::Invalid("changeset_max_target must be positive"));
        }
        if self.wal_sync_buffer < -1 {
            return Err(IavlError::Invalid("wal_sync_buffer must be -1 or more"));
        }
        Ok(())
    }

    /// Sync policy described by `wal_sync_buffer`.
    pub fn wal_sync_policy(&self) -> WalSyncPolicy {
        match usize::try_from(self.wal_sync_buffer) {
            Err(_) => WalSyncPolicy::Inline,
            Ok(buffer) => WalSyncPolicy::Background {
                buffer: buffer.max(1),
            },
        }
    }

    /// Sets [`Options::zero_copy`].
    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    /// Sets [`Options::evict_depth`].
    pub fn with_evict_depth(mut self, depth: u8) -> Self {
        self.evict_depth = depth;
        self
    }

    /// Sets [`Options::write_wal`].
    pub fn with_write_wal(mut self, write_wal: bool) -> Self {
        self.write_wal = write_wal;
        self
    }

    /// Sets [`Options::wal_sync_buffer`].
    pub fn with_wal_sync_buffer(mut self, buffer: i32) -> Self {
        self.wal_sync_buffer = buffer;
        self
    }

    /// Sets [`Options::compact_wal`].
    pub fn with_compact_wal(mut self, compact_wal: bool) -> Self {
        self.compact_wal = compact_wal;
        self
    }

    /// Sets [`Options::disable_compaction`].
    pub fn with_compaction_disabled(mut self, disabled: bool) -> Self {
        self.disable_compaction = disabled;
        self
    }

    /// Sets [`Options::compaction_orphan_ratio`].
    pub fn with_compaction_orphan_ratio(mut self, ratio: f64) -> Self {
        self.compaction_orphan_ratio = ratio;
        self
    }

    /// Sets [`Options::compaction_orphan_age`].
    pub fn with_compaction_orphan_age(mut self, age: f64) -> Self {
        self.compaction_orphan_age = age;
        self
    }

    /// Sets [`Options::retain_versions`].
    pub fn with_retain_versions(mut self, versions: u32) -> Self {
        self.retain_versions = versions;
        self
    }

    /// Sets [`Options::min_compaction_seconds`].
    pub fn with_min_compaction_seconds(mut self, seconds: u32) -> Self {
        self.min_compaction_seconds = seconds;
        self
    }

    /// Sets [`Options::changeset_max_target`].
    pub fn with_changeset_max_target(mut self, bytes: u64) -> Self {
        self.changeset_max_target = bytes;
        self
    }
}
