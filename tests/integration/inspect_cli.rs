#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use iavlx::{Db, IavlError, Options, Result};
use serde_json::Value;
use tempfile::tempdir;

/// Three versions; `opts` decides how many land in sealed changesets.
fn seed(dir: &Path, opts: Options) -> Result<()> {
    let db = Db::open(dir, &["bank"], opts)?;
    for version in 1..=3u32 {
        let mut multi = db.branch()?;
        let tree = multi
            .tree_mut("bank")
            .ok_or(IavlError::Invalid("missing tree"))?;
        tree.set(format!("acct-{version}"), format!("{}", version * 100))?;
        if version == 3 {
            tree.remove(b"acct-1")?;
        }
        db.apply(multi)?;
        db.commit()?;
    }
    db.close()?;
    Ok(())
}

fn per_version() -> Options {
    Options::default().with_changeset_max_target(1)
}

fn json(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("iavlx-inspect")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn changesets_lists_one_directory_per_version() -> Result<()> {
    let dir = tempdir()?;
    seed(dir.path(), per_version())?;
    let rows = json(&["changesets"], &dir.path().join("bank"));
    let rows = rows.as_array().expect("array");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["start_version"], 1);
    assert_eq!(rows[0]["leaves"], 1);
    assert_eq!(rows[2]["info"]["end_version"], 3);
    assert!(rows[0]["kv_bytes"].as_u64().unwrap_or(0) > 0);
    Ok(())
}

#[test]
fn versions_reports_roots() -> Result<()> {
    let dir = tempdir()?;
    seed(dir.path(), per_version())?;
    let rows = json(&["versions"], &dir.path().join("bank"));
    let rows = rows.as_array().expect("array");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["version"], 1);
    assert_eq!(rows[0]["root_id"], "L1.1");
    assert_eq!(rows[1]["branches"], 1);
    assert_eq!(rows[1]["root_id"], "B2.1");
    Ok(())
}

#[test]
fn wal_counts_updates_per_commit() -> Result<()> {
    let dir = tempdir()?;
    seed(dir.path(), Options::default())?;
    let report = json(&["wal"], &dir.path().join("bank"));
    let commits = report["commits"].as_array().expect("array");
    assert_eq!(commits.len(), 3);
    assert_eq!(commits[0]["version"], 1);
    assert_eq!(commits[0]["sets"], 1);
    assert_eq!(commits[2]["deletes"], 1);
    assert_eq!(report["uncommitted_updates"], 0);
    assert_eq!(commits[2]["tail"], report["log_bytes"]);

    let sealed = tempdir()?;
    seed(sealed.path(), per_version())?;
    let report = json(&["wal"], &sealed.path().join("bank"));
    assert_eq!(report["commits"].as_array().map(Vec::len), Some(0));
    assert_eq!(report["log_bytes"], 0);
    Ok(())
}

#[test]
fn get_reads_latest_and_older_versions() -> Result<()> {
    let dir = tempdir()?;
    seed(dir.path(), Options::default())?;

    let output = cargo_bin_cmd!("iavlx-inspect")
        .args(["--format", "json", "get"])
        .arg(dir.path())
        .args(["bank", "acct-2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(report["version"], 3);
    assert_eq!(report["value"], "200");

    let output = cargo_bin_cmd!("iavlx-inspect")
        .args(["get", "--version", "2", "--hex"])
        .arg(dir.path())
        .args(["bank", "acct-1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), hex::encode("100"));

    cargo_bin_cmd!("iavlx-inspect")
        .args(["get"])
        .arg(dir.path())
        .args(["bank", "acct-1"])
        .assert()
        .code(2);

    cargo_bin_cmd!("iavlx-inspect")
        .args(["get"])
        .arg(dir.path())
        .args(["missing", "acct-1"])
        .assert()
        .failure();
    Ok(())
}
