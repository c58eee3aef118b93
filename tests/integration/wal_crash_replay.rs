#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{abort, Command};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use iavlx::{
    primitives::{
        io::Record,
        wal::{decode_commit_records, WAL_COMMIT_FILE, WAL_LOG_FILE},
    },
    storage::{changeset::parse_dir_name, CounterMetrics, LeafLayout, VersionInfo},
    Db, Hash, IavlError, Options, Result,
};
use tempfile::tempdir;

/// One changeset directory per version; the WAL is emptied at every commit.
fn opts() -> Options {
    Options::default().with_changeset_max_target(1)
}

fn commit_range(db: &Db, range: std::ops::Range<u32>) -> Result<Hash> {
    let mut multi = db.branch()?;
    let tree = multi
        .tree_mut("state")
        .ok_or(IavlError::Invalid("missing tree"))?;
    for i in range {
        tree.set(format!("key-{i:05}"), format!("value-{i}"))?;
    }
    db.apply(multi)?;
    Ok(db.commit()?.stores[0].hash)
}

fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[test]
fn lost_changeset_is_rebuilt_from_the_wal() -> Result<()> {
    let dir = tempdir()?;
    let tree_dir = dir.path().join("state");
    {
        let db = Db::open(dir.path(), &["state"], opts())?;
        commit_range(&db, 0..50)?;
        commit_range(&db, 50..100)?;
        db.close()?;
    }
    let hash = {
        let db = Db::open(dir.path(), &["state"], Options::default())?;
        let hash = commit_range(&db, 100..150)?;
        db.close()?;
        hash
    };
    // Versions 1 and 2 were sealed before version 3 was logged.
    let commits = decode_commit_records(&fs::read(tree_dir.join(WAL_COMMIT_FILE))?);
    assert_eq!(commits.iter().map(|c| c.version).collect::<Vec<_>>(), vec![3]);
    assert!(tree_dir.join("3").is_dir());
    fs::remove_dir_all(tree_dir.join("3"))?;

    let metrics = Arc::new(CounterMetrics::default());
    let db = Db::open_with_metrics(dir.path(), &["state"], Options::default(), metrics.clone())?;
    assert_eq!(db.latest_version(), 3);
    assert_eq!(db.tree("state").map(|t| t.hash()), Some(hash));
    assert_eq!(metrics.wal_entries_replayed.load(Ordering::Relaxed), 50);
    assert!(tree_dir.join("3").is_dir(), "replay saves the version again");

    let snap = db.snapshot(3)?;
    let tree = snap.tree("state").ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(tree.size()?, 150);
    assert_eq!(
        tree.get(b"key-00120")?.as_deref(),
        Some(&b"value-120"[..])
    );
    db.close()?;
    Ok(())
}

/// Start version of the newest changeset directory.
fn newest_changeset(tree_dir: &Path) -> Result<Option<u32>> {
    let mut newest = None;
    for entry in fs::read_dir(tree_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((start, _)) = parse_dir_name(&name) {
            newest = newest.max(Some(start));
        }
    }
    Ok(newest)
}

#[test]
fn sealed_versions_are_trimmed_from_the_wal() -> Result<()> {
    let dir = tempdir()?;
    let tree_dir = dir.path().join("state");
    let db = Db::open(dir.path(), &["state"], opts())?;
    for round in 0..20u32 {
        commit_range(&db, round * 10..round * 10 + 10)?;
        db.flush()?;
        assert_eq!(fs::metadata(tree_dir.join(WAL_LOG_FILE))?.len(), 0);
        assert_eq!(fs::metadata(tree_dir.join(WAL_COMMIT_FILE))?.len(), 0);
    }
    let hash = db.tree("state").map(|t| t.hash());
    db.close()?;

    let db = Db::open(dir.path(), &["state"], opts())?;
    assert_eq!(db.latest_version(), 20);
    assert_eq!(db.tree("state").map(|t| t.hash()), hash);
    db.close()?;
    Ok(())
}

#[test]
fn wal_only_holds_versions_of_the_open_changeset() -> Result<()> {
    let dir = tempdir()?;
    let tree_dir = dir.path().join("state");
    let db = Db::open(
        dir.path(),
        &["state"],
        Options::default()
            .with_changeset_max_target(16 * 1024)
            .with_compaction_disabled(true),
    )?;
    for round in 0..100u32 {
        commit_range(&db, round * 10..round * 10 + 10)?;
        db.flush()?;
        let commits = decode_commit_records(&fs::read(tree_dir.join(WAL_COMMIT_FILE))?);
        let len = fs::metadata(tree_dir.join(WAL_LOG_FILE))?.len();
        if let Some(first) = commits.first() {
            assert_eq!(Some(first.version as u32), newest_changeset(&tree_dir)?);
            assert_eq!(commits.last().map(|c| c.version), Some(u64::from(round) + 1));
            assert_eq!(commits.last().map(|c| c.tail), Some(len));
        } else {
            assert_eq!(len, 0);
        }
    }
    let changesets = fs::read_dir(&tree_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .count();
    assert!(changesets >= 3, "only {changesets} changesets were written");
    db.close()?;
    Ok(())
}

#[test]
fn uncommitted_wal_bytes_are_discarded() -> Result<()> {
    let dir = tempdir()?;
    let tree_dir = dir.path().join("state");
    let (hash, log_len) = {
        let db = Db::open(dir.path(), &["state"], Options::default())?;
        commit_range(&db, 0..10)?;
        let hash = commit_range(&db, 10..20)?;
        db.close()?;
        (hash, fs::metadata(tree_dir.join(WAL_LOG_FILE))?.len())
    };

    // A set that never saw its commit, then half a commit record.
    append(&tree_dir.join(WAL_LOG_FILE), &[0, 3, b'z', b'z', b'z', 1, b'!'])?;
    append(&tree_dir.join(WAL_COMMIT_FILE), &[3, 0, 0, 0, 0, 0, 0])?;

    let db = Db::open(dir.path(), &["state"], Options::default())?;
    assert_eq!(db.latest_version(), 2);
    assert_eq!(db.tree("state").map(|t| t.hash()), Some(hash));
    let snap = db.snapshot(2)?;
    let tree = snap.tree("state").ok_or(IavlError::Invalid("missing tree"))?;
    assert!(!tree.has(b"zzz")?);
    db.close()?;

    assert_eq!(fs::metadata(tree_dir.join(WAL_LOG_FILE))?.len(), log_len);
    let commits = decode_commit_records(&fs::read(tree_dir.join(WAL_COMMIT_FILE))?);
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[1].version, 2);
    assert_eq!(commits[1].tail, log_len);
    Ok(())
}

#[test]
fn torn_changeset_tail_is_cut_back_and_replayed() -> Result<()> {
    let dir = tempdir()?;
    let cs_dir = dir.path().join("state").join("1");
    let hash = {
        let db = Db::open(dir.path(), &["state"], Options::default())?;
        commit_range(&db, 0..40)?;
        commit_range(&db, 40..80)?;
        let hash = commit_range(&db, 80..120)?;
        db.close()?;
        hash
    };

    // Version 3 lost its index entry and leaves.dat ends mid-record.
    let versions = fs::read(cs_dir.join("versions.dat"))?;
    assert_eq!(versions.len(), 3 * VersionInfo::SIZE);
    fs::write(cs_dir.join("versions.dat"), &versions[..2 * VersionInfo::SIZE])?;
    append(&cs_dir.join("leaves.dat"), &[0xff; LeafLayout::SIZE / 2])?;

    let db = Db::open(dir.path(), &["state"], Options::default())?;
    assert_eq!(db.latest_version(), 3);
    assert_eq!(db.tree("state").map(|t| t.hash()), Some(hash));
    db.close()?;

    let leaves = fs::metadata(cs_dir.join("leaves.dat"))?.len();
    assert_eq!(leaves % LeafLayout::SIZE as u64, 0);
    assert_eq!(
        fs::metadata(cs_dir.join("versions.dat"))?.len(),
        2 * VersionInfo::SIZE as u64
    );
    // The repaired changeset is sealed, so the replayed version starts a new one.
    assert!(dir.path().join("state").join("3").is_dir());
    Ok(())
}

#[test]
fn wal_disabled_leaves_no_log() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), &["state"], opts().with_write_wal(false))?;
    commit_range(&db, 0..5)?;
    db.close()?;
    assert!(!dir.path().join("state").join(WAL_LOG_FILE).exists());

    let db = Db::open(dir.path(), &["state"], opts().with_write_wal(false))?;
    assert_eq!(db.latest_version(), 1);
    db.close()?;
    Ok(())
}

#[test]
fn abort_after_flush_recovers() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crash-harness");

    // Spawn this test binary in a mode that commits, flushes, then aborts.
    let child_status = Command::new(std::env::current_exe()?)
        .env("IAVLX_CRASH_DB_PATH", &db_path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_abort_after_flush")
        .status()
        .expect("spawn child");

    assert!(!child_status.success(), "child should abort");

    let expected = fs::read_to_string(db_path.join("expected-hash"))?;
    let db = Db::open(&db_path, &["state"], Options::default().with_wal_sync_buffer(4))?;
    assert_eq!(db.latest_version(), 5);
    let hash = db
        .tree("state")
        .map(|t| hex::encode(t.hash()))
        .ok_or(IavlError::Invalid("missing tree"))?;
    assert_eq!(hash, expected.trim());
    db.close()?;
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_flush() -> Result<()> {
    let path = std::env::var("IAVLX_CRASH_DB_PATH").expect("missing IAVLX_CRASH_DB_PATH");
    let db_path = std::path::PathBuf::from(path);
    let db = Db::open(&db_path, &["state"], Options::default().with_wal_sync_buffer(4))?;
    let mut hash = [0u8; 32];
    for round in 0..5u32 {
        hash = commit_range(&db, round * 20..round * 20 + 20)?;
    }
    db.flush()?;
    fs::write(db_path.join("expected-hash"), hex::encode(hash))?;

    // Simulate an abrupt crash before close seals anything.
    abort();
}
