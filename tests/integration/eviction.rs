#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use iavlx::{storage::CounterMetrics, Db, IavlError, Options, Result};
use tempfile::tempdir;

fn key(i: u32) -> Bytes {
    Bytes::from(format!("k{i:04}"))
}

fn fill(db: &Db, range: std::ops::Range<u32>) -> Result<()> {
    let mut multi = db.branch()?;
    let tree = multi
        .tree_mut("store")
        .ok_or(IavlError::Invalid("missing tree"))?;
    for i in range {
        tree.set(key(i), format!("v{i}"))?;
    }
    db.apply(multi)?;
    db.commit()?;
    Ok(())
}

fn evicting_db(dir: &std::path::Path, zero_copy: bool, metrics: Arc<CounterMetrics>) -> Result<Db> {
    let opts = Options::default()
        .with_evict_depth(2)
        .with_zero_copy(zero_copy);
    Db::open_with_metrics(dir, &["store"], opts, metrics)
}

fn reads_after_eviction(zero_copy: bool) -> Result<()> {
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let db = evicting_db(dir.path(), zero_copy, metrics.clone())?;
    fill(&db, 0..300)?;
    db.flush()?;
    assert!(metrics.nodes_evicted.load(Ordering::Relaxed) > 0);

    // The staged tree starts from the partly evicted root.
    let mut multi = db.branch()?;
    let tree = multi
        .tree_mut("store")
        .ok_or(IavlError::Invalid("missing tree"))?;
    for i in (0..300).step_by(7) {
        assert_eq!(tree.get(&key(i))?, Some(Bytes::from(format!("v{i}"))));
    }
    assert_eq!(tree.remove(&key(1))?, Some(Bytes::from_static(b"v1")));
    tree.set(key(1000), "fresh")?;
    db.apply(multi)?;
    let hash = db.commit()?.stores[0].hash;
    db.flush()?;

    let snap = db.snapshot(2)?;
    let tree = snap.tree("store").ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(tree.size()?, 300);
    assert!(!tree.has(&key(1))?);
    let all: Vec<(Bytes, Bytes)> = tree.iter(None, None, true)?.collect::<Result<_>>()?;
    assert_eq!(all.len(), 300);
    assert!(all.windows(2).all(|pair| pair[0].0 < pair[1].0));
    db.close()?;

    let db = evicting_db(dir.path(), zero_copy, Arc::new(CounterMetrics::default()))?;
    assert_eq!(db.tree("store").map(|t| t.hash()), Some(hash));
    db.close()?;
    Ok(())
}

#[test]
fn evicted_nodes_reload_from_disk() -> Result<()> {
    reads_after_eviction(false)
}

#[test]
fn evicted_nodes_reload_zero_copy() -> Result<()> {
    reads_after_eviction(true)
}

#[test]
fn default_options_keep_nodes_resident() -> Result<()> {
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let db = Db::open_with_metrics(dir.path(), &["store"], Options::default(), metrics.clone())?;
    fill(&db, 0..50)?;
    db.flush()?;
    assert_eq!(metrics.nodes_evicted.load(Ordering::Relaxed), 0);
    db.close()?;
    Ok(())
}
