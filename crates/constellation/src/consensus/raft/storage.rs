//! Persistent storage for consensus state.
//!
//! [`FileStorage`] keeps three files under its directory: the hard state
//! (term and vote), an append-only log of length-prefixed bincode records,
//! and the latest snapshot. Rewrites go through a temp file and rename.
//!
//! The consensus core calls storage synchronously from its event loop, so
//! a write is durable before the reply that depends on it. Each fsync runs
//! under [`tokio::task::block_in_place`] on a multi-threaded runtime; the
//! loop still waits for it, but other tasks keep their worker threads.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::runtime::{Handle, RuntimeFlavor};

use constellation_common::{ConstellationError, Result};

use super::{LogEntry, LogIndex, NodeId, Term, Voters};

const HARD_STATE_FILE: &str = "hard_state.bin";
const LOG_FILE: &str = "log.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// State that must survive restarts before answering any RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// State machine image plus the log position it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Voter set in effect at `last_included_index`
    pub voters: Voters,
    pub data: Vec<u8>,
}

/// Durable backing for the consensus core
pub trait RaftStorage: Send + Sync + 'static {
    fn load_hard_state(&self) -> Result<HardState>;
    fn save_hard_state(&self, state: &HardState) -> Result<()>;

    /// Entries after the latest snapshot, in index order
    fn load_entries(&self) -> Result<Vec<LogEntry>>;
    fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;
    /// Drop `index` and everything after it
    fn truncate_from(&self, index: LogIndex) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>>;
    /// Persist a snapshot and drop the entries it covers
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConstellationError::Encoding(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ConstellationError::Encoding(e.to_string()))
}

/// File-backed storage
pub struct FileStorage {
    dir: PathBuf,
    /// Mirror of the on-disk log, used for rewrites
    entries: Mutex<Vec<LogEntry>>,
}

impl FileStorage {
    /// Open (or create) storage in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot_index = match read_optional(&dir.join(SNAPSHOT_FILE))? {
            Some(bytes) => decode::<Snapshot>(&bytes)?.last_included_index,
            None => 0,
        };
        let (entries, torn) = read_log(&dir.join(LOG_FILE))?;
        let entries: Vec<LogEntry> = entries.into_iter().filter(|e| e.index > snapshot_index).collect();

        tracing::debug!(
            dir = %dir.display(),
            entries = entries.len(),
            snapshot_index,
            "Opened consensus storage"
        );

        let storage = Self {
            dir,
            entries: Mutex::new(entries),
        };
        if torn {
            storage.rewrite_log(&storage.entries.lock())?;
        }
        Ok(storage)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            push_record(&mut buf, entry)?;
        }
        write_atomic(&self.path(LOG_FILE), &buf)
    }
}

impl RaftStorage for FileStorage {
    fn load_hard_state(&self) -> Result<HardState> {
        match read_optional(&self.path(HARD_STATE_FILE))? {
            Some(bytes) => decode(&bytes),
            None => Ok(HardState::default()),
        }
    }

    fn save_hard_state(&self, state: &HardState) -> Result<()> {
        write_atomic(&self.path(HARD_STATE_FILE), &encode(state)?)
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().clone())
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            push_record(&mut buf, entry)?;
        }

        let mut cached = self.entries.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(LOG_FILE))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buf)?;
        writer.flush()?;
        blocking(|| writer.get_ref().sync_data())?;

        cached.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut cached = self.entries.lock();
        if cached.last().is_none_or(|e| e.index < index) {
            return Ok(());
        }
        cached.retain(|e| e.index < index);
        self.rewrite_log(&cached)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match read_optional(&self.path(SNAPSHOT_FILE))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        write_atomic(&self.path(SNAPSHOT_FILE), &encode(snapshot)?)?;

        let mut cached = self.entries.lock();
        cached.retain(|e| e.index > snapshot.last_included_index);
        self.rewrite_log(&cached)
    }
}

fn push_record(buf: &mut Vec<u8>, entry: &LogEntry) -> Result<()> {
    let bytes = encode(entry)?;
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse the log file. The flag reports a torn trailing record.
fn read_log(path: &Path) -> Result<(Vec<LogEntry>, bool)> {
    let Some(bytes) = read_optional(path)? else {
        return Ok((Vec::new(), false));
    };

    let mut entries = Vec::new();
    let mut cursor = bytes.as_slice();
    while !cursor.is_empty() {
        let mut len = [0u8; 4];
        let len = match cursor.read_exact(&mut len) {
            Ok(()) => u32::from_le_bytes(len) as usize,
            Err(_) => return Ok(torn(path, entries)),
        };
        if cursor.len() < len {
            return Ok(torn(path, entries));
        }
        let (record, rest) = cursor.split_at(len);
        entries.push(decode(record)?);
        cursor = rest;
    }
    Ok((entries, false))
}

fn torn(path: &Path, entries: Vec<LogEntry>) -> (Vec<LogEntry>, bool) {
    tracing::warn!(path = %path.display(), kept = entries.len(), "Dropping torn record at end of consensus log");
    (entries, true)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    blocking(|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })?;
    Ok(())
}

/// Run a blocking disk operation, handing the worker thread's other tasks
/// off first when the runtime allows it
fn blocking<T>(op: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(op),
        _ => op(),
    }
}

#[derive(Default)]
struct MemInner {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

/// Volatile storage for tests and throwaway nodes
#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemStorage {
    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.inner.lock().hard_state.clone())
    }

    fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.inner.lock().hard_state = state.clone();
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.inner.lock().entries.clone())
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        self.inner.lock().entries.retain(|e| e.index < index);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.index > snapshot.last_included_index);
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
