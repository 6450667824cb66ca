//! The transaction journal: an append-only structured record of every
//! operation and its outcome.
//!
//! One JSON document per line, written with O_APPEND and fsync'd on each
//! append. Volumes are low-rate; durability wins over throughput. The core
//! never rotates this file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use strum_macros::Display as StrumDisplay;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JournalAction {
    Snapshot,
    Transfer,
    Prune,
    Restore,
    Verify,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JournalStatus {
    Started,
    Completed,
    Failed,
    Partial,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    /// Per-process monotonic sequence; breaks wall-clock ties.
    pub seq: u64,
    pub action: JournalAction,
    pub status: JournalStatus,
    pub volume: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes_transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_detail: Option<String>,
    /// Shared by every entry of one orchestrator action.
    pub correlation_id: Uuid,
}

impl JournalEntry {
    pub fn new(action: JournalAction, status: JournalStatus, volume: &str, correlation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            seq: 0,
            action,
            status,
            volume: volume.to_string(),
            destination: None,
            bytes_transferred: None,
            duration_ms: None,
            error_kind: None,
            error_detail: None,
            correlation_id,
        }
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, kind: &str, detail: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_detail = Some(detail.to_string());
        self
    }
}

/// Append-only journal writer. Thread-safe: appends are serialized on the
/// file handle, sequence numbers on an atomic.
pub struct Journal {
    file: Mutex<File>,
    seq: AtomicU64,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create journal directory {:?}", parent))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open transaction journal at {:?}", path))?;
        Ok(Self {
            file: Mutex::new(file),
            seq: AtomicU64::new(0),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, mut entry: JournalEntry) -> Result<()> {
        entry.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_vec(&entry).context("journal entry failed to serialize")?;
        line.push(b'\n');
        let mut file = self.file.lock().expect("journal writers never panic holding the lock");
        file.write_all(&line).context("journal append failed")?;
        file.sync_data().context("journal fsync failed")?;
        Ok(())
    }
}

const TAIL_CHUNK: u64 = 64 * 1024;

/// Read the last `count` entries by seeking backward in 64 KiB chunks. A
/// torn final line (crash mid-append) is skipped.
pub fn tail(path: &Path, count: usize) -> Result<Vec<JournalEntry>> {
    let mut file = File::open(path).with_context(|| format!("cannot open journal at {:?}", path))?;
    let len = file.metadata()?.len();
    let mut entries: Vec<JournalEntry> = Vec::new();
    let mut end = len;
    let mut pending = Vec::new();

    while end > 0 && entries.len() < count {
        let start = end.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&pending);

        let mut lines: Vec<&[u8]> = chunk.split(|b| *b == b'\n').collect();
        // The first fragment may be the tail of a line in the previous
        // (earlier) chunk; hold it over unless this chunk is the start of
        // the file.
        pending = if start > 0 { lines.remove(0).to_vec() } else { Vec::new() };

        for line in lines.iter().rev() {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_slice::<JournalEntry>(line) {
                entries.push(entry);
                if entries.len() == count {
                    break;
                }
            }
        }
        end = start;
    }

    entries.reverse();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(volume: &str, correlation: Uuid) -> JournalEntry {
        JournalEntry::new(JournalAction::Transfer, JournalStatus::Completed, volume, correlation)
    }

    #[test]
    fn append_assigns_monotonic_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let journal = Journal::open(&path).unwrap();
        let correlation = Uuid::new_v4();

        for i in 0..5 {
            journal.append(entry(&format!("vol{}", i), correlation)).unwrap();
        }

        let entries = tail(&path, 10).unwrap();
        assert_eq!(entries.len(), 5);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(entries.iter().all(|e| e.correlation_id == correlation));
    }

    #[test]
    fn tail_returns_newest_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let journal = Journal::open(&path).unwrap();

        for i in 0..100 {
            journal.append(entry(&format!("vol{}", i), Uuid::new_v4())).unwrap();
        }

        let entries = tail(&path, 3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].volume, "vol97");
        assert_eq!(entries[2].volume, "vol99");
    }

    #[test]
    fn tail_tolerates_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let journal = Journal::open(&path).unwrap();
        journal.append(entry("vol-ok", Uuid::new_v4())).unwrap();
        drop(journal);

        use std::io::Write;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"timestamp\":\"2026-01-").unwrap();

        let entries = tail(&path, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].volume, "vol-ok");
    }

    #[test]
    fn entry_builder_fills_optional_fields() {
        let e = entry("home", Uuid::new_v4())
            .destination("ssh://nas/pool")
            .bytes(1024)
            .duration_ms(2500)
            .error("parent-missing", "destination lost the parent");
        assert_eq!(e.destination.as_deref(), Some("ssh://nas/pool"));
        assert_eq!(e.bytes_transferred, Some(1024));
        assert_eq!(e.error_kind.as_deref(), Some("parent-missing"));
    }

    #[test]
    fn entries_round_trip_as_single_lines() {
        let e = entry("home", Uuid::new_v4()).bytes(7);
        let line = serde_json::to_string(&e).unwrap();
        assert!(!line.contains('\n'));
        let parsed: JournalEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, e);
    }
}
