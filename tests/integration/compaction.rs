#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use iavlx::{
    storage::{changeset::parse_dir_name, CounterMetrics},
    Db, Hash, IavlError, Options, Result,
};
use tempfile::tempdir;

const KEYS: u32 = 16;
const VERSIONS: u32 = 20;

fn opts(compact_wal: bool) -> Options {
    Options::default()
        .with_changeset_max_target(1)
        .with_retain_versions(2)
        .with_min_compaction_seconds(0)
        .with_compaction_orphan_ratio(0.1)
        .with_compact_wal(compact_wal)
}

fn key(i: u32) -> String {
    format!("acct/{i:03}")
}

fn value(version: u32, i: u32) -> String {
    format!("{version}:{i}")
}

/// Rewrites every key in every version so old changesets fill with orphans.
fn churn(db: &Db) -> Result<Hash> {
    let mut hash = [0u8; 32];
    for version in 1..=VERSIONS {
        let mut multi = db.branch()?;
        let tree = multi
            .tree_mut("ledger")
            .ok_or(IavlError::Invalid("missing tree"))?;
        for i in 0..KEYS {
            tree.set(key(i), value(version, i))?;
        }
        db.apply(multi)?;
        hash = db.commit()?.stores[0].hash;
    }
    db.flush()?;
    Ok(hash)
}

fn compacted_dirs(tree_dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(tree_dir)? {
        let name = entry?.file_name();
        if let Some((_, revision)) = name.to_str().and_then(parse_dir_name) {
            if revision > 0 {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn check_retained(db: &Db) -> Result<()> {
    for version in [VERSIONS - 2, VERSIONS - 1, VERSIONS] {
        let snap = db.snapshot(version)?;
        let tree = snap.tree("ledger").ok_or(IavlError::Invalid("missing tree"))?;
        assert_eq!(tree.size()?, i64::from(KEYS));
        for i in 0..KEYS {
            assert_eq!(
                tree.get(key(i).as_bytes())?.as_deref(),
                Some(value(version, i).as_bytes())
            );
        }
    }
    assert!(matches!(db.snapshot(3), Err(IavlError::InvalidOwned(_))));
    Ok(())
}

fn run(compact_wal: bool) -> Result<()> {
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let db = Db::open_with_metrics(dir.path(), &["ledger"], opts(compact_wal), metrics.clone())?;
    let hash = churn(&db)?;

    assert!(metrics.compactions.load(Ordering::Relaxed) > 0);
    assert!(metrics.records_dropped.load(Ordering::Relaxed) > 0);
    assert!(compacted_dirs(&dir.path().join("ledger"))? > 0);
    check_retained(&db)?;
    db.close()?;

    let db = Db::open(dir.path(), &["ledger"], opts(compact_wal))?;
    assert_eq!(db.latest_version(), VERSIONS);
    assert_eq!(db.tree("ledger").map(|t| t.hash()), Some(hash));
    check_retained(&db)?;

    // Commits continue on top of the compacted history.
    let mut multi = db.branch()?;
    multi
        .tree_mut("ledger")
        .ok_or(IavlError::Invalid("missing tree"))?
        .remove(key(0).as_bytes())?;
    db.apply(multi)?;
    db.commit()?;
    db.flush()?;
    let snap = db.snapshot(VERSIONS + 1)?;
    let tree = snap.tree("ledger").ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(tree.size()?, i64::from(KEYS - 1));
    db.close()?;
    Ok(())
}

#[test]
fn compaction_rewriting_the_kv_log_keeps_retained_versions() -> Result<()> {
    run(true)
}

#[test]
fn compaction_sharing_the_kv_log_keeps_retained_versions() -> Result<()> {
    run(false)
}

#[test]
fn disabled_compaction_keeps_every_version() -> Result<()> {
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let db = Db::open_with_metrics(
        dir.path(),
        &["ledger"],
        opts(true).with_compaction_disabled(true),
        metrics.clone(),
    )?;
    churn(&db)?;
    assert_eq!(metrics.compactions.load(Ordering::Relaxed), 0);
    assert_eq!(compacted_dirs(&dir.path().join("ledger"))?, 0);
    let snap = db.snapshot(1)?;
    let tree = snap.tree("ledger").ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(tree.get(key(5).as_bytes())?.as_deref(), Some(value(1, 5).as_bytes()));
    db.close()?;
    Ok(())
}
