//! Read-only inspection of iavlx tree directories.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use iavlx::{
    db::CommitTree,
    primitives::{
        io::Record,
        wal::{decode_commit_records, KvUpdate, WalEntry, WalIterator, WAL_COMMIT_FILE, WAL_LOG_FILE},
    },
    storage::{
        changeset::{parse_dir_name, BRANCHES_FILE, INFO_FILE, KV_FILE, LEAVES_FILE, VERSIONS_FILE},
        default_metrics, BranchLayout, ChangesetInfo, LeafLayout, VersionInfo,
    },
    Options,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "iavlx-inspect",
    version,
    about = "Inspect iavlx tree directories",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List the changesets of a tree")]
    Changesets {
        #[arg(value_name = "TREE_DIR")]
        tree_dir: PathBuf,
    },

    #[command(about = "List every saved version of a tree")]
    Versions {
        #[arg(value_name = "TREE_DIR")]
        tree_dir: PathBuf,
    },

    #[command(about = "Summarize the write-ahead log of a tree")]
    Wal {
        #[arg(value_name = "TREE_DIR")]
        tree_dir: PathBuf,
    },

    #[command(about = "Read one key from a tree of a database")]
    Get {
        #[arg(value_name = "DB_DIR")]
        db_dir: PathBuf,

        #[arg(value_name = "TREE")]
        tree: String,

        #[arg(value_name = "KEY")]
        key: String,

        #[arg(long, value_name = "FILE", help = "TOML or JSON options file")]
        options: Option<PathBuf>,

        #[arg(long, help = "Read this version instead of the latest")]
        version: Option<u32>,

        #[arg(long, help = "Print the value as hex")]
        hex: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct ChangesetRow {
    dir: String,
    start_version: u32,
    revision: u32,
    info: ChangesetInfo,
    leaves: u64,
    branches: u64,
    versions: u64,
    kv_bytes: u64,
}

#[derive(Serialize)]
struct VersionRow {
    version: u32,
    changeset: String,
    leaves: u32,
    branches: u32,
    root_id: String,
}

#[derive(Serialize)]
struct WalCommitRow {
    version: u64,
    tail: u64,
    sets: u64,
    deletes: u64,
}

#[derive(Serialize)]
struct WalReport {
    log_bytes: u64,
    commits: Vec<WalCommitRow>,
    uncommitted_updates: u64,
}

#[derive(Serialize)]
struct GetReport {
    tree: String,
    version: u32,
    key: String,
    found: bool,
    value: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Changesets { tree_dir } => {
            let rows = changeset_rows(&tree_dir)?;
            emit(cli.format, &rows, || print_changesets(&rows))?;
        }
        Command::Versions { tree_dir } => {
            let rows = version_rows(&tree_dir)?;
            emit(cli.format, &rows, || print_versions(&rows))?;
        }
        Command::Wal { tree_dir } => {
            let report = wal_report(&tree_dir)?;
            emit(cli.format, &report, || print_wal(&report))?;
        }
        Command::Get {
            db_dir,
            tree,
            key,
            options,
            version,
            hex,
        } => {
            let report = get(&db_dir, &tree, &key, options.as_deref(), version, hex)?;
            emit(cli.format, &report, || match &report.value {
                Some(value) => println!("{value}"),
                None => println!("(not found at version {})", report.version),
            })?;
            if !report.found {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(),
    }
    Ok(())
}

/// Changeset directories in version order, newest revision per start.
fn changeset_dirs(tree_dir: &Path) -> Result<Vec<(u32, u32, PathBuf)>, Box<dyn Error>> {
    let mut found: Vec<(u32, u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(tree_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some((start, revision)) = name.to_str().and_then(parse_dir_name) {
            found.push((start, revision, entry.path()));
        }
    }
    found.sort();
    let mut latest: Vec<(u32, u32, PathBuf)> = Vec::with_capacity(found.len());
    for entry in found {
        if latest.last().is_some_and(|prev| prev.0 == entry.0) {
            latest.pop();
        }
        latest.push(entry);
    }
    Ok(latest)
}

fn records<T: Record>(path: &Path) -> Result<Vec<T>, Box<dyn Error>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    Ok(raw.chunks_exact(T::SIZE).map(T::decode).collect())
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn changeset_rows(tree_dir: &Path) -> Result<Vec<ChangesetRow>, Box<dyn Error>> {
    let mut rows = Vec::new();
    for (start_version, revision, dir) in changeset_dirs(tree_dir)? {
        let info = records::<ChangesetInfo>(&dir.join(INFO_FILE))?
            .into_iter()
            .next()
            .unwrap_or_default();
        rows.push(ChangesetRow {
            dir: dir.display().to_string(),
            start_version,
            revision,
            info,
            leaves: file_len(&dir.join(LEAVES_FILE)) / LeafLayout::SIZE as u64,
            branches: file_len(&dir.join(BRANCHES_FILE)) / BranchLayout::SIZE as u64,
            versions: file_len(&dir.join(VERSIONS_FILE)) / VersionInfo::SIZE as u64,
            kv_bytes: file_len(&dir.join(KV_FILE)),
        });
    }
    Ok(rows)
}

fn print_changesets(rows: &[ChangesetRow]) {
    println!(
        "{:<12} {:>8} {:>10} {:>10} {:>10} {:>10} {:>12}",
        "start", "rev", "end", "leaves", "branches", "orphans", "kv_bytes"
    );
    for row in rows {
        println!(
            "{:<12} {:>8} {:>10} {:>10} {:>10} {:>10} {:>12}",
            row.start_version,
            row.revision,
            row.info.end_version,
            row.leaves,
            row.branches,
            row.info.orphans(),
            row.kv_bytes
        );
    }
}

fn version_rows(tree_dir: &Path) -> Result<Vec<VersionRow>, Box<dyn Error>> {
    let mut rows = Vec::new();
    for (start_version, _, dir) in changeset_dirs(tree_dir)? {
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for (offset, vi) in records::<VersionInfo>(&dir.join(VERSIONS_FILE))?
            .into_iter()
            .enumerate()
        {
            rows.push(VersionRow {
                version: start_version + offset as u32,
                changeset: name.clone(),
                leaves: vi.leaves.count,
                branches: vi.branches.count,
                root_id: vi.root_id.to_string(),
            });
        }
    }
    Ok(rows)
}

fn print_versions(rows: &[VersionRow]) {
    println!(
        "{:<10} {:<12} {:>8} {:>8}  root",
        "version", "changeset", "leaves", "branches"
    );
    for row in rows {
        println!(
            "{:<10} {:<12} {:>8} {:>8}  {}",
            row.version, row.changeset, row.leaves, row.branches, row.root_id
        );
    }
}

fn wal_report(tree_dir: &Path) -> Result<WalReport, Box<dyn Error>> {
    let log = match fs::read(tree_dir.join(WAL_LOG_FILE)) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    let raw_commits = match fs::read(tree_dir.join(WAL_COMMIT_FILE)) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    let log_bytes = log.len() as u64;
    let index = decode_commit_records(&raw_commits);

    let mut commits = Vec::with_capacity(index.len());
    let (mut sets, mut deletes) = (0u64, 0u64);
    let mut entries = WalIterator::new(log.into());
    while let Some(entry) = entries.next_entry()? {
        match entry {
            WalEntry::Update(KvUpdate::Set { .. }) => sets += 1,
            WalEntry::Update(KvUpdate::Delete { .. }) => deletes += 1,
            WalEntry::Commit(version) => {
                let tail = index
                    .iter()
                    .find(|rec| rec.version == version)
                    .map_or(entries.offset() as u64, |rec| rec.tail);
                commits.push(WalCommitRow {
                    version,
                    tail,
                    sets,
                    deletes,
                });
                sets = 0;
                deletes = 0;
            }
        }
    }
    Ok(WalReport {
        log_bytes,
        commits,
        uncommitted_updates: sets + deletes,
    })
}

fn print_wal(report: &WalReport) {
    println!("log bytes: {}", report.log_bytes);
    println!("{:<10} {:>12} {:>8} {:>8}", "version", "tail", "sets", "deletes");
    for row in &report.commits {
        println!(
            "{:<10} {:>12} {:>8} {:>8}",
            row.version, row.tail, row.sets, row.deletes
        );
    }
    if report.uncommitted_updates > 0 {
        println!("uncommitted updates: {}", report.uncommitted_updates);
    }
}

fn get(
    db_dir: &Path,
    tree: &str,
    key: &str,
    options: Option<&Path>,
    version: Option<u32>,
    hex: bool,
) -> Result<GetReport, Box<dyn Error>> {
    let opts = match options {
        None => Options::default(),
        Some(path) => {
            let src = fs::read_to_string(path)?;
            if path.extension().is_some_and(|ext| ext == "json") {
                Options::from_json_str(&src)?
            } else {
                Options::from_toml_str(&src)?
            }
        }
    };
    let tree_dir = db_dir.join(tree);
    if !tree_dir.is_dir() {
        return Err(format!("no tree {tree:?} in {}", db_dir.display()).into());
    }
    let handle = CommitTree::open(tree, &tree_dir, opts, default_metrics())?;
    let version = version.unwrap_or_else(|| handle.version());
    let value = handle.snapshot(version)?.get(key.as_bytes())?;
    handle.close()?;
    Ok(GetReport {
        tree: tree.to_string(),
        version,
        key: key.to_string(),
        found: value.is_some(),
        value: value.map(|value| {
            if hex {
                ::hex::encode(&value)
            } else {
                String::from_utf8_lossy(&value).into_owned()
            }
        }),
    })
}
