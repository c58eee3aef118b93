#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use bytes::Bytes;
use iavlx::{
    primitives::io::Record,
    storage::{LeafLayout, VersionInfo},
    tree::empty_hash,
    Db, IavlError, Options, Result,
};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

fn open(dir: &Path) -> Result<Db> {
    Db::open(dir, &["main"], Options::default())
}

fn commit_with<F>(db: &Db, edit: F) -> Result<[u8; 32]>
where
    F: FnOnce(&mut iavlx::Tree) -> Result<()>,
{
    let mut multi = db.branch()?;
    let tree = multi
        .tree_mut("main")
        .ok_or(IavlError::Invalid("missing tree"))?;
    edit(tree)?;
    db.apply(multi)?;
    Ok(db.commit()?.stores[0].hash)
}

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

#[test]
fn empty_tree_hashes_to_sha256_of_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let info = db.commit()?;
    let expected: [u8; 32] = Sha256::digest(b"").into();
    assert_eq!(info.stores[0].hash, expected);
    assert_eq!(
        hex::encode(expected),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(empty_hash(), expected);
    Ok(())
}

#[test]
fn single_insert_writes_exact_files() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    commit_with(&db, |tree| tree.set("k", "v").map(drop))?;
    db.close()?;

    let cs = dir.path().join("main").join("1");
    assert_eq!(
        fs::read(cs.join("kv.dat"))?,
        vec![1, 0, 0, 0, b'k', 1, 0, 0, 0, b'v']
    );
    let leaves = fs::read(cs.join("leaves.dat"))?;
    assert_eq!(leaves.len(), LeafLayout::SIZE);
    let leaf = LeafLayout::decode(&leaves);
    assert_eq!(leaf.id.to_string(), "L1.1");
    assert_eq!(leaf.key_offset, 0);
    assert_eq!(leaf.orphan_version, 0);
    assert!(fs::read(cs.join("branches.dat"))?.is_empty());

    let versions = fs::read(cs.join("versions.dat"))?;
    assert_eq!(versions.len(), VersionInfo::SIZE);
    let vi = VersionInfo::decode(&versions);
    assert_eq!((vi.leaves.count, vi.branches.count), (1, 0));
    assert_eq!(vi.root_id, leaf.id);
    Ok(())
}

#[test]
fn insert_delete_reinsert_changes_the_hash() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let first = commit_with(&db, |tree| tree.set("a", "1").map(drop))?;
    let removed = commit_with(&db, |tree| {
        assert_eq!(tree.remove(b"a")?, Some(Bytes::from_static(b"1")));
        Ok(())
    })?;
    let again = commit_with(&db, |tree| tree.set("a", "1").map(drop))?;
    assert_eq!(removed, empty_hash());
    assert_ne!(first, again, "leaf hashes cover the creating version");
    assert_ne!(first, removed);
    Ok(())
}

#[test]
fn commit_without_changes_repeats_the_hash() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let hash = commit_with(&db, |tree| {
        for i in 0..10 {
            tree.set(key(i), "x")?;
        }
        Ok(())
    })?;
    assert_eq!(db.commit()?.stores[0].hash, hash);
    assert_eq!(db.commit()?.stores[0].hash, hash);
    assert_eq!(db.latest_version(), 3);
    db.close()?;

    let versions = fs::read(dir.path().join("main").join("1").join("versions.dat"))?;
    let infos: Vec<VersionInfo> = versions
        .chunks_exact(VersionInfo::SIZE)
        .map(VersionInfo::decode)
        .collect();
    assert_eq!(infos.len(), 3);
    assert_eq!(infos[1].leaves.count + infos[1].branches.count, 0);
    assert_eq!(infos[1].root_id, infos[0].root_id);
    Ok(())
}

#[test]
fn ascending_inserts_stay_within_the_avl_height_bound() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    for chunk in (1..=1024u32).collect::<Vec<_>>().chunks(128) {
        commit_with(&db, |tree| {
            for i in chunk {
                tree.set(key(*i), key(*i))?;
            }
            Ok(())
        })?;
    }
    db.flush()?;
    let snap = db.snapshot(db.latest_version())?;
    let tree = snap.tree("main").ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(tree.size()?, 1024);
    let bound = 1.44 * (1024f64 + 2.0).log2();
    assert!(f64::from(tree.height()?) <= bound, "height {}", tree.height()?);
    for i in 1..=1024u32 {
        assert_eq!(tree.get(&key(i))?.as_deref(), Some(&key(i)[..]));
    }
    assert_eq!(tree.get_with_index(&key(1))?.0, 0);
    assert_eq!(tree.get_with_index(&key(1024))?.0, 1023);
    Ok(())
}

#[test]
fn values_survive_reopen_and_removals_stick() -> Result<()> {
    let dir = tempdir()?;
    let hash = {
        let db = open(dir.path())?;
        commit_with(&db, |tree| {
            for i in 0..200 {
                tree.set(key(i), format!("v{i}"))?;
            }
            Ok(())
        })?;
        let hash = commit_with(&db, |tree| {
            for i in (0..200).step_by(3) {
                assert!(tree.remove(&key(i))?.is_some());
            }
            assert_eq!(tree.remove(b"never-set")?, None);
            Ok(())
        })?;
        db.close()?;
        hash
    };

    let db = open(dir.path())?;
    assert_eq!(db.latest_version(), 2);
    assert_eq!(db.tree("main").map(|t| t.hash()), Some(hash));
    let snap = db.snapshot(2)?;
    let tree = snap.tree("main").ok_or(IavlError::Invalid("missing tree"))?;
    for i in 0..200 {
        let expected = (i % 3 != 0).then(|| Bytes::from(format!("v{i}")));
        assert_eq!(tree.get(&key(i))?, expected);
    }
    let old = db.snapshot(1)?;
    assert_eq!(old.tree("main").map(|t| t.size()).transpose()?, Some(200));

    let keys: Vec<Bytes> = tree
        .iter(Some(&key(10)[..]), Some(&key(20)[..]), true)?
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let expected: Vec<Bytes> = (10..20)
        .filter(|i| i % 3 != 0)
        .map(|i| Bytes::from(key(i)))
        .collect();
    assert_eq!(keys, expected);
    Ok(())
}

#[test]
fn replaced_nodes_are_stamped_with_the_orphaning_version() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    commit_with(&db, |tree| tree.set("a", "1").map(drop))?;
    commit_with(&db, |tree| tree.set("a", "2").map(drop))?;
    db.close()?;

    let leaves = fs::read(dir.path().join("main").join("1").join("leaves.dat"))?;
    let records: Vec<LeafLayout> = leaves
        .chunks_exact(LeafLayout::SIZE)
        .map(LeafLayout::decode)
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].orphan_version, 2);
    assert_eq!(records[1].orphan_version, 0);
    Ok(())
}
