#![allow(missing_docs)]

use std::path::Path;

use iavlx::{db::aggregate_hash, CommitInfo, Db, IavlError, Options, Result};
use tempfile::tempdir;

const NAMES: [&str; 4] = ["acc", "bank", "gov", "staking"];

fn stage(db: &Db, version: u32, order: &[&str]) -> Result<CommitInfo> {
    let mut multi = db.branch()?;
    assert_eq!(multi.version(), version);
    for name in order {
        let tree = multi
            .tree_mut(name)
            .ok_or_else(|| IavlError::InvalidOwned(format!("missing tree {name}")))?;
        for i in 0..64u32 {
            tree.set(format!("{name}/{i:03}"), format!("{version}-{i}"))?;
        }
        if version > 1 {
            tree.remove(format!("{name}/{:03}", version).as_bytes())?;
        }
    }
    db.apply(multi)?;
    db.commit()
}

fn history(dir: &Path, order: &[&str]) -> Result<Vec<CommitInfo>> {
    let db = Db::open(dir, &NAMES, Options::default())?;
    let infos = (1..=5)
        .map(|version| stage(&db, version, order))
        .collect::<Result<Vec<_>>>()?;
    db.close()?;
    Ok(infos)
}

#[test]
fn hashes_do_not_depend_on_tree_edit_order() -> Result<()> {
    let dir = tempdir()?;
    let forward = history(&dir.path().join("forward"), &NAMES)?;
    let mut reversed = NAMES;
    reversed.reverse();
    let backward = history(&dir.path().join("backward"), &reversed)?;
    assert_eq!(forward, backward);

    for info in &forward {
        assert_eq!(info.hash, aggregate_hash(&info.stores));
        let names: Vec<&str> = info.stores.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, NAMES);
        assert!(info.stores.iter().all(|s| s.version == info.version));
    }
    Ok(())
}

#[test]
fn names_are_sorted_and_trees_reopen_together() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let db = Db::open(dir.path(), &["staking", "acc", "gov", "bank"], Options::default())?;
        assert_eq!(db.tree_names(), NAMES);
        let mut last = None;
        for version in 1..=3 {
            last = Some(stage(&db, version, &NAMES)?);
        }
        db.close()?;
        last.ok_or(IavlError::Invalid("no commits"))?
    };

    let db = Db::open(dir.path(), &NAMES, Options::default())?;
    assert_eq!(db.latest_version(), 3);
    for store in &last.stores {
        let tree = db
            .tree(&store.name)
            .ok_or(IavlError::Invalid("missing tree"))?;
        assert_eq!(tree.hash(), store.hash);
        assert_eq!(tree.version(), 3);
    }
    let snap = db.snapshot(2)?;
    assert_eq!(snap.names(), NAMES);
    for (name, tree) in snap.iter() {
        assert!(tree.is_read_only());
        assert_eq!(
            tree.get(format!("{name}/010").as_bytes())?.as_deref(),
            Some(&b"2-10"[..])
        );
        assert!(!tree.has(format!("{name}/002").as_bytes())?);
    }
    db.close()?;
    Ok(())
}

#[test]
fn trees_at_different_versions_refuse_to_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), &["acc"], Options::default())?;
        db.commit()?;
        db.commit()?;
        db.close()?;
    }
    match Db::open(dir.path(), &["acc", "bank"], Options::default()) {
        Err(IavlError::CorruptionOwned(msg)) => assert!(msg.contains("bank"), "{msg}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("open should fail"),
    }
    Ok(())
}

#[test]
fn stale_multi_trees_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), &NAMES, Options::default())?;
    let early = db.branch()?;
    stage(&db, 1, &NAMES)?;
    assert!(db.apply(early).is_err());
    assert_eq!(db.latest_version(), 1);
    db.close()?;
    Ok(())
}

#[test]
fn apply_changes_no_tree_when_one_is_stale() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), &["a", "b"], Options::default())?;
    let mut multi = db.branch()?;
    for name in ["a", "b"] {
        multi
            .tree_mut(name)
            .ok_or(IavlError::Invalid("missing tree"))?
            .set("k", "1")?;
    }
    db.apply(multi)?;
    db.commit()?;

    let mut multi = db.branch()?;
    for name in ["a", "b"] {
        multi
            .tree_mut(name)
            .ok_or(IavlError::Invalid("missing tree"))?
            .set("k", "2")?;
    }
    let b = db.tree("b").ok_or(IavlError::Invalid("missing tree"))?;
    let mut conflicting = b.branch()?;
    conflicting.set("k", "3")?;
    b.apply(conflicting)?;

    assert!(matches!(db.apply(multi), Err(IavlError::StaleBranch)));
    let info = db.commit()?;
    assert_eq!(info.version, 2);
    let snap = db.snapshot(2)?;
    let get = |name: &str| -> Result<Option<bytes::Bytes>> {
        snap.tree(name).ok_or(IavlError::Invalid("missing tree"))?.get(b"k")
    };
    assert_eq!(get("a")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(get("b")?.as_deref(), Some(&b"3"[..]));
    db.close()?;
    Ok(())
}

#[test]
fn commit_advances_no_tree_when_one_cannot_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), &["a", "b"], Options::default())?;
    let mut multi = db.branch()?;
    multi
        .tree_mut("a")
        .ok_or(IavlError::Invalid("missing tree"))?
        .set("k", "1")?;
    db.apply(multi)?;

    db.tree("b").ok_or(IavlError::Invalid("missing tree"))?.close()?;
    assert!(matches!(db.commit(), Err(IavlError::Closed)));
    for name in ["a", "b"] {
        assert_eq!(db.tree(name).map(|tree| tree.version()), Some(0));
    }
    assert_eq!(db.latest_version(), 0);
    Ok(())
}
