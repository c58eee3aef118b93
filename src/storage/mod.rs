//! On-disk node storage.
//!
//! A tree's history lives in a sequence of changesets, each covering a
//! contiguous range of versions with its own leaf, branch, version and kv
//! files. [`TreeStore`] owns that sequence: it appends new versions, stamps
//! orphans, seals full changesets and compacts old ones.

/// Changeset directories and the version index over them.
pub mod changeset;

/// Rewriting sealed changesets without unreachable records.
pub mod compaction;

/// Key/value blob log.
pub mod kvlog;

/// Fixed-size record layouts.
pub mod layout;

mod metrics;
mod tree_store;
mod writer;

pub use changeset::{Changeset, ChangesetIndex};
pub use compaction::CompactionStats;
pub use kvlog::MAX_KEY_LEN;
pub use layout::{BranchLayout, ChangesetInfo, LeafLayout, NodeSetInfo, VersionInfo};

/// Store instrumentation.
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StoreMetrics};

pub use tree_store::TreeStore;
pub use writer::ChangesetWriter;
