#![forbid(unsafe_code)]

//! Per-tree write-ahead log.
//!
//! `wal.log` is a stream of entries: `0x00 uv(klen) key uv(vlen) value`
//! (set), `0x01 uv(klen) key` (delete) and `0x02 uv(version)` (commit).
//! `wal.commit` holds one 16-byte `(version, tail)` record per commit, where
//! `tail` is the log length right after that commit's entry. Bytes past the
//! last recorded tail never belonged to a commit and are cut off on open.
//!
//! Once a version is sealed into a changeset its prefix of the log is no
//! longer needed; [`Wal::trim_through`] drops it and rebases the remaining
//! tails.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::primitives::bytes::{buf::Cursor, le, var};
use crate::primitives::io::{sync_dir, MmapFile, Record, StructFile};
use crate::types::{IavlError, Result};

/// Log file name inside a tree directory.
pub const WAL_LOG_FILE: &str = "wal.log";
/// Commit index file name inside a tree directory.
pub const WAL_COMMIT_FILE: &str = "wal.commit";

const WAL_LOG_NEXT: &str = "wal.log.next";
const WAL_COMMIT_NEXT: &str = "wal.commit.next";

const OP_SET: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_COMMIT: u8 = 2;

/// One logged mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvUpdate {
    /// Insert or overwrite.
    Set {
        /// Key.
        key: Bytes,
        /// Value.
        value: Bytes,
    },
    /// Removal of an existing key.
    Delete {
        /// Key.
        key: Bytes,
    },
}

impl KvUpdate {
    /// Key the update touches.
    pub fn key(&self) -> &Bytes {
        match self {
            KvUpdate::Set { key, .. } | KvUpdate::Delete { key } => key,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            KvUpdate::Set { key, value } => {
                out.push(OP_SET);
                var::encode_u64(key.len() as u64, out);
                out.extend_from_slice(key);
                var::encode_u64(value.len() as u64, out);
                out.extend_from_slice(value);
            }
            KvUpdate::Delete { key } => {
                out.push(OP_DELETE);
                var::encode_u64(key.len() as u64, out);
                out.extend_from_slice(key);
            }
        }
    }
}

/// Decoded log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalEntry {
    /// A mutation of the version being staged.
    Update(KvUpdate),
    /// End of the updates of `version`.
    Commit(u64),
}

/// Commit index record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct WalCommit {
    /// Committed version.
    pub version: u64,
    /// Log length after the commit entry.
    pub tail: u64,
}

impl Record for WalCommit {
    const SIZE: usize = 16;

    fn encode(&self, dst: &mut [u8]) {
        le::put_u64(dst, 0, self.version);
        le::put_u64(dst, 8, self.tail);
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            version: le::get_u64(src, 0),
            tail: le::get_u64(src, 8),
        }
    }
}

/// Decodes whole commit records from raw `wal.commit` bytes, ignoring a
/// partial trailing record.
pub fn decode_commit_records(raw: &[u8]) -> Vec<WalCommit> {
    raw.chunks_exact(WalCommit::SIZE)
        .map(WalCommit::decode)
        .collect()
}

struct WalFiles {
    log: MmapFile,
    commits: StructFile<WalCommit>,
}

impl WalFiles {
    fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            log: MmapFile::open(dir.join(WAL_LOG_FILE))?,
            commits: StructFile::open_repairing(dir.join(WAL_COMMIT_FILE))?,
        })
    }
}

/// Write-ahead log of one tree.
pub struct Wal {
    dir: PathBuf,
    files: RwLock<WalFiles>,
    last: Mutex<Option<WalCommit>>,
}

impl Wal {
    /// Opens the log in `dir`, dropping whatever follows the last complete
    /// commit.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        recover_trim(&dir)?;
        let files = WalFiles::open(&dir)?;
        let WalFiles { log, commits } = &files;

        let log_len = log.len();
        let mut count = commits.count();
        while count > 0 && commits.get(count - 1)?.tail > log_len {
            count -= 1;
        }
        if count < commits.count() {
            warn!(
                dropped = commits.count() - count,
                "wal.drop_commits_past_log_end"
            );
            commits.truncate(count)?;
        }
        let last = match count {
            0 => None,
            n => Some(commits.get(n - 1)?),
        };
        let tail = last.map_or(0, |rec| rec.tail);
        if log_len > tail {
            warn!(bytes = log_len - tail, "wal.truncate_uncommitted");
            log.truncate(tail)?;
        }
        debug!(
            commits = count,
            last_version = last.map_or(0, |rec| rec.version),
            "wal.open"
        );
        Ok(Self {
            dir,
            files: RwLock::new(files),
            last: Mutex::new(last),
        })
    }

    /// Last commit record, if any.
    pub fn last_commit(&self) -> Option<WalCommit> {
        *self.last.lock()
    }

    /// Current log length, including buffered bytes.
    pub fn len(&self) -> u64 {
        self.files.read().log.len()
    }

    /// True when nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.files.read().log.is_empty()
    }

    /// Appends updates for the version being staged.
    pub fn append_updates(&self, updates: &[KvUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for update in updates {
            update.encode(&mut buf);
        }
        self.files.read().log.append(&buf)?;
        Ok(())
    }

    /// Appends a commit entry and its index record. Nothing is synced.
    pub fn append_commit(&self, version: u64) -> Result<WalCommit> {
        let mut last = self.last.lock();
        if let Some(prev) = *last {
            if version <= prev.version {
                return Err(IavlError::InvalidOwned(format!(
                    "wal commit {version} does not follow {}",
                    prev.version
                )));
            }
        }
        let files = self.files.read();
        let mut buf = vec![OP_COMMIT];
        var::encode_u64(version, &mut buf);
        files.log.append(&buf)?;
        files.log.flush()?;
        let rec = WalCommit {
            version,
            tail: files.log.len(),
        };
        files.commits.append(&rec)?;
        files.commits.file().flush()?;
        *last = Some(rec);
        Ok(rec)
    }

    /// Flushes and fsyncs both files.
    pub fn sync(&self) -> Result<()> {
        let files = self.files.read();
        files.log.sync()?;
        files.commits.sync()
    }

    /// Log offset where the updates following `version` start: the tail of
    /// the newest commit at or below it, 0 when there is none.
    pub fn replay_offset(&self, version: u64) -> Result<u64> {
        let files = self.files.read();
        Ok(tail_through(&files.commits, version)?.unwrap_or(0))
    }

    /// Entries from `offset` to the end of the log.
    pub fn entries_from(&self, offset: u64) -> Result<WalIterator> {
        let files = self.files.read();
        files.log.save_and_remap()?;
        let len = files.log.mapped_len();
        if offset >= len {
            return Ok(WalIterator::new(Bytes::new()));
        }
        let span = usize::try_from(len - offset)
            .map_err(|_| IavlError::OutOfRange("wal span exceeds usize"))?;
        Ok(WalIterator::new(files.log.slice(offset, span)?.into_bytes()))
    }

    /// Every commit record.
    pub fn commits(&self) -> Result<Vec<WalCommit>> {
        let files = self.files.read();
        files.commits.save_and_remap()?;
        (0..files.commits.mapped_count())
            .map(|pos| files.commits.get(pos))
            .collect()
    }

    /// Drops every commit at or below `version` along with its entries and
    /// returns the number of log bytes removed.
    ///
    /// The remaining log and commit records are written to `.next` files and
    /// renamed over the live ones, `wal.commit` first. [`Wal::open`] finishes
    /// or discards a rotation that was interrupted.
    pub fn trim_through(&self, version: u64) -> Result<u64> {
        let mut last = self.last.lock();
        let mut files = self.files.write();
        let Some(cut) = tail_through(&files.commits, version)? else {
            return Ok(0);
        };
        if cut == 0 {
            return Ok(0);
        }
        files.log.flush()?;
        let len = files.log.len();
        let span = usize::try_from(len - cut)
            .map_err(|_| IavlError::OutOfRange("wal span exceeds usize"))?;
        let mut rest = vec![0u8; span];
        if !rest.is_empty() {
            files.log.read_at(cut, &mut rest)?;
        }

        let mut kept: Vec<u8> = Vec::new();
        for pos in 0..files.commits.mapped_count() {
            let rec = files.commits.get(pos)?;
            if rec.version > version {
                kept.resize(kept.len() + WalCommit::SIZE, 0);
                let at = kept.len() - WalCommit::SIZE;
                WalCommit {
                    version: rec.version,
                    tail: rec.tail - cut,
                }
                .encode(&mut kept[at..]);
            }
        }

        let commit_next = self.dir.join(WAL_COMMIT_NEXT);
        let log_next = self.dir.join(WAL_LOG_NEXT);
        write_synced(&commit_next, &kept)?;
        write_synced(&log_next, &rest)?;
        fs::rename(&commit_next, self.dir.join(WAL_COMMIT_FILE))?;
        fs::rename(&log_next, self.dir.join(WAL_LOG_FILE))?;
        sync_dir(&self.dir)?;
        *files = WalFiles::open(&self.dir)?;

        if let Some(prev) = last.as_mut() {
            prev.tail -= cut;
        }
        info!(
            through = version,
            bytes = cut,
            kept_commits = kept.len() / WalCommit::SIZE,
            "wal.trimmed"
        );
        Ok(cut)
    }
}

/// Tail of the newest commit at or below `version`.
fn tail_through(commits: &StructFile<WalCommit>, version: u64) -> Result<Option<u64>> {
    commits.save_and_remap()?;
    let (mut lo, mut hi) = (0u32, commits.mapped_count());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if commits.get(mid)?.version <= version {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    match lo {
        0 => Ok(None),
        n => Ok(Some(commits.get(n - 1)?.tail)),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Settles a trim that stopped part way. Once `wal.commit.next` is gone the
/// new commit index is live and only the log rename may be missing;
/// otherwise the old files are still authoritative.
fn recover_trim(dir: &Path) -> Result<()> {
    let commit_next = dir.join(WAL_COMMIT_NEXT);
    let log_next = dir.join(WAL_LOG_NEXT);
    match (commit_next.exists(), log_next.exists()) {
        (false, false) => return Ok(()),
        (false, true) => {
            warn!("wal.finish_trim");
            fs::rename(&log_next, dir.join(WAL_LOG_FILE))?;
        }
        (true, log) => {
            warn!("wal.discard_unfinished_trim");
            fs::remove_file(&commit_next)?;
            if log {
                fs::remove_file(&log_next)?;
            }
        }
    }
    sync_dir(dir)
}

/// Decoder over a span of `wal.log`.
pub struct WalIterator {
    buf: Bytes,
    offset: usize,
}

impl WalIterator {
    /// Iterates the entries encoded in `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decodes the next entry; `None` at the end of the span.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.offset >= self.buf.len() {
            return Ok(None);
        }
        let total = self.buf.len();
        let mut cur = Cursor::new(&self.buf[self.offset..]);
        // Position in `buf` of a field the cursor has just consumed.
        let span = |cur: &Cursor<'_>, len: usize| {
            let end = total - cur.remaining();
            end - len..end
        };
        let entry = match cur.u8()? {
            OP_SET => {
                let key = cur.len_prefixed()?.len();
                let key = span(&cur, key);
                let value = cur.len_prefixed()?.len();
                let value = span(&cur, value);
                WalEntry::Update(KvUpdate::Set {
                    key: self.buf.slice(key),
                    value: self.buf.slice(value),
                })
            }
            OP_DELETE => {
                let key = cur.len_prefixed()?.len();
                let key = span(&cur, key);
                WalEntry::Update(KvUpdate::Delete {
                    key: self.buf.slice(key),
                })
            }
            OP_COMMIT => WalEntry::Commit(cur.uvarint()?),
            op => {
                return Err(IavlError::CorruptionOwned(format!(
                    "unknown wal opcode {op:#04x} at offset {}",
                    self.offset
                )))
            }
        };
        self.offset = self.buf.len() - cur.remaining();
        Ok(Some(entry))
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Background fsync of a [`Wal`].
///
/// Commits hand their version to [`WalSyncer::request`] and continue; at
/// most `buffer` requests wait unsynced before the next request blocks.
/// Queued requests are coalesced into one fsync.
pub struct WalSyncer {
    tx: Option<SyncSender<u64>>,
    handle: Option<JoinHandle<()>>,
}

impl WalSyncer {
    /// Starts the sync thread. Sync failures are passed to `on_error`, after
    /// which the thread stops.
    pub fn spawn<F>(wal: Arc<Wal>, buffer: usize, on_error: F) -> Result<Self>
    where
        F: Fn(IavlError) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(buffer.max(1));
        let handle = thread::Builder::new()
            .name("iavlx-wal-sync".into())
            .spawn(move || Self::worker_loop(wal, rx, on_error))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn worker_loop<F: Fn(IavlError)>(wal: Arc<Wal>, rx: Receiver<u64>, on_error: F) {
        while let Ok(mut version) = rx.recv() {
            while let Ok(next) = rx.try_recv() {
                version = next;
            }
            if let Err(err) = wal.sync() {
                warn!(version, error = %err, "wal.syncer.failed");
                on_error(err);
                break;
            }
            debug!(version, "wal.syncer.synced");
        }
        debug!("wal.syncer.exit");
    }

    /// Queues a sync covering `version`, blocking while the buffer is full.
    pub fn request(&self, version: u64) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(IavlError::Closed)?;
        match tx.try_send(version) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(version)) => tx.send(version).map_err(|_| IavlError::Closed),
            Err(TrySendError::Disconnected(_)) => Err(IavlError::Closed),
        }
    }

    /// Waits for queued syncs and stops the thread.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("wal.syncer.panicked");
            }
        }
    }
}

impl Drop for WalSyncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
