//! Outbox journal (JSONL)
//!
//! Each line is one operation: `put` (insert or replace an entry by id),
//! `remove`, or `watermark` (highest event seq ever written). Mutations are
//! appended; compaction rewrites the live entries to a sibling temp file and
//! renames it into place, so a crash mid-write never leaves a truncated
//! outbox.
//!
//! File IO runs on a dedicated writer thread fed by an unbounded channel.
//! Callers never wait on the disk except for an explicit `flush`.

use crate::domain::outbox::{DeliveryStatus, OutboxEntry};
use crate::infra::metrics::Metrics;
use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Put { entry: OutboxEntry },
    Remove { id: Uuid },
    Watermark { seq: u64 },
}

/// Result of replaying the journal
#[derive(Debug, Default)]
pub struct LoadedOutbox {
    /// Live entries in enqueue order
    pub entries: Vec<OutboxEntry>,
    /// Highest seq seen in any line (0 if none)
    pub last_seq: u64,
    /// Lines replayed
    pub journal_lines: usize,
}

pub struct OutboxStore {
    path: PathBuf,
    appender: Option<BufWriter<File>>,
    last_seq: u64,
}

impl OutboxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), appender: None, last_seq: 0 }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the journal
    ///
    /// A missing file is an empty outbox. Corrupt lines are skipped and
    /// IN_FLIGHT entries revert to PENDING.
    pub fn load(&mut self) -> anyhow::Result<LoadedOutbox> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "outbox_journal_missing");
                return Ok(LoadedOutbox::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open outbox: {}", self.path.display()))
            }
        };

        let mut slots: Vec<Option<OutboxEntry>> = Vec::new();
        let mut index: FxHashMap<Uuid, usize> = FxHashMap::default();
        let mut loaded = LoadedOutbox::default();
        let mut skipped = 0usize;

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read outbox: {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let op = match serde_json::from_str::<StoreOp>(&line) {
                Ok(op) => op,
                Err(e) => {
                    skipped += 1;
                    warn!(line = %(line_no + 1), error = %e, "outbox_line_corrupt");
                    continue;
                }
            };
            loaded.journal_lines += 1;
            match op {
                StoreOp::Put { entry } => {
                    loaded.last_seq = loaded.last_seq.max(entry.event.seq);
                    match index.get(&entry.id) {
                        Some(&slot) => slots[slot] = Some(entry),
                        None => {
                            index.insert(entry.id, slots.len());
                            slots.push(Some(entry));
                        }
                    }
                }
                StoreOp::Remove { id } => {
                    if let Some(slot) = index.remove(&id) {
                        slots[slot] = None;
                    }
                }
                StoreOp::Watermark { seq } => loaded.last_seq = loaded.last_seq.max(seq),
            }
        }

        let mut reverted = 0usize;
        loaded.entries = slots
            .into_iter()
            .flatten()
            .map(|mut entry| {
                if entry.status == DeliveryStatus::InFlight {
                    entry.status = DeliveryStatus::Pending;
                    reverted += 1;
                }
                entry
            })
            .collect();
        self.last_seq = loaded.last_seq;

        info!(
            path = %self.path.display(),
            entries = %loaded.entries.len(),
            journal_lines = %loaded.journal_lines,
            last_seq = %loaded.last_seq,
            reverted = %reverted,
            skipped = %skipped,
            "outbox_loaded"
        );
        Ok(loaded)
    }

    /// Append operations and sync them to disk
    pub fn append(&mut self, ops: &[StoreOp]) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.appender.is_none() {
            self.ensure_parent()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open outbox for append: {}", self.path.display()))?;
            self.appender = Some(BufWriter::new(file));
        }
        let Some(writer) = self.appender.as_mut() else {
            return Ok(());
        };

        for op in ops {
            if let StoreOp::Put { entry } = op {
                self.last_seq = self.last_seq.max(entry.event.seq);
            }
            serde_json::to_writer(&mut *writer, op)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("Failed to sync: {}", self.path.display()))?;
        Ok(())
    }

    /// Rewrite the journal as a watermark plus one `put` per live entry
    pub fn compact(&mut self, entries: &[OutboxEntry]) -> anyhow::Result<()> {
        self.appender = None;
        self.ensure_parent()?;
        self.last_seq = entries.iter().map(|e| e.event.seq).fold(self.last_seq, u64::max);

        let tmp = self.path.with_extension("jsonl.tmp");
        let file = File::create(&tmp).with_context(|| format!("Failed to create: {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &StoreOp::Watermark { seq: self.last_seq })?;
        writer.write_all(b"\n")?;
        for entry in entries {
            // Borrowed form of `StoreOp::Put`
            serde_json::to_writer(&mut writer, &PutRef { op: "put", entry })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()
            .with_context(|| format!("Failed to sync: {}", tmp.display()))?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to rename {} to {}", tmp.display(), self.path.display()))?;
        debug!(path = %self.path.display(), entries = %entries.len(), "outbox_compacted");
        Ok(())
    }

    fn ensure_parent(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct PutRef<'a> {
    op: &'static str,
    entry: &'a OutboxEntry,
}

enum StoreCommand {
    Append(Vec<StoreOp>),
    Compact(Vec<OutboxEntry>),
    Flush(Vec<OutboxEntry>, oneshot::Sender<()>),
}

/// Sending side of the journal writer thread
///
/// Sends never block. The thread exits once every handle is dropped.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    /// Start the writer thread owning `store`
    pub fn spawn(store: OutboxStore, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("outbox-writer".into())
            .spawn(move || run_writer(store, rx, metrics))
            .context("Failed to spawn outbox writer")?;
        Ok(Self { tx })
    }

    pub fn append(&self, ops: Vec<StoreOp>) {
        if !ops.is_empty() && self.tx.send(StoreCommand::Append(ops)).is_err() {
            warn!("outbox_writer_gone");
        }
    }

    pub fn compact(&self, entries: Vec<OutboxEntry>) {
        if self.tx.send(StoreCommand::Compact(entries)).is_err() {
            warn!("outbox_writer_gone");
        }
    }

    /// Queue a compaction and return a receiver that fires once it is on disk
    pub fn flush(&self, entries: Vec<OutboxEntry>) -> oneshot::Receiver<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Flush(entries, reply)).is_err() {
            warn!("outbox_writer_gone");
        }
        rx
    }
}

/// Drains every queued command per wakeup so a burst costs one fsync
fn run_writer(mut store: OutboxStore, mut rx: mpsc::UnboundedReceiver<StoreCommand>, metrics: Arc<Metrics>) {
    debug!(path = %store.path().display(), "outbox_writer_started");
    while let Some(first) = rx.blocking_recv() {
        let mut pending: Vec<StoreOp> = Vec::new();
        let mut waiters = Vec::new();
        let mut next = Some(first);

        while let Some(command) = next.take() {
            match command {
                StoreCommand::Append(ops) => pending.extend(ops),
                // A snapshot already reflects every op queued before it
                StoreCommand::Compact(entries) => {
                    pending.clear();
                    if let Err(e) = store.compact(&entries) {
                        metrics.record_outbox_persist_error();
                        warn!(error = %e, path = %store.path().display(), "outbox_compact_failed");
                    }
                }
                StoreCommand::Flush(entries, reply) => {
                    pending.clear();
                    if let Err(e) = store.compact(&entries) {
                        metrics.record_outbox_persist_error();
                        warn!(error = %e, path = %store.path().display(), "outbox_flush_failed");
                    }
                    waiters.push(reply);
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = store.append(&pending) {
            metrics.record_outbox_persist_error();
            warn!(error = %e, ops = %pending.len(), path = %store.path().display(), "outbox_append_failed");
        }
        for reply in waiters {
            let _ = reply.send(());
        }
    }
    debug!(path = %store.path().display(), "outbox_writer_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{Event, EventPayload};
    use crate::domain::types::LocationSample;
    use tempfile::TempDir;

    fn entry(seq: u64, status: DeliveryStatus) -> OutboxEntry {
        let event = Event::new(seq, 1_000, EventPayload::Location(LocationSample::new(1_000, 1.0, 2.0)));
        let mut e = OutboxEntry::new(event, 1_000);
        e.status = status;
        e
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = OutboxStore::new(dir.path().join("outbox.jsonl")).load().unwrap();
        assert!(loaded.entries.is_empty());
        assert_eq!(loaded.last_seq, 0);
    }

    #[test]
    fn test_compact_reload_reverts_in_flight() {
        let dir = TempDir::new().unwrap();
        let mut store = OutboxStore::new(dir.path().join("nested/outbox.jsonl"));
        let entries = vec![entry(1, DeliveryStatus::InFlight), entry(2, DeliveryStatus::Failed)];
        store.compact(&entries).unwrap();

        let loaded = OutboxStore::new(store.path()).load().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].id, entries[0].id);
        assert_eq!(loaded.entries[0].status, DeliveryStatus::Pending);
        assert_eq!(loaded.entries[1].status, DeliveryStatus::Failed);
        assert!(!dir.path().join("nested/outbox.jsonl.tmp").exists());
    }

    #[test]
    fn test_journal_replay_applies_ops_in_order() {
        let dir = TempDir::new().unwrap();
        let mut store = OutboxStore::new(dir.path().join("outbox.jsonl"));
        let a = entry(1, DeliveryStatus::Pending);
        let b = entry(2, DeliveryStatus::Pending);
        let mut b_retry = b.clone();
        b_retry.status = DeliveryStatus::Failed;
        b_retry.attempts = 1;

        store
            .append(&[
                StoreOp::Put { entry: a.clone() },
                StoreOp::Put { entry: b.clone() },
                StoreOp::Put { entry: b_retry.clone() },
                StoreOp::Remove { id: a.id },
            ])
            .unwrap();

        let loaded = OutboxStore::new(store.path()).load().unwrap();
        assert_eq!(loaded.entries, vec![b_retry]);
        assert_eq!(loaded.last_seq, 2);
        assert_eq!(loaded.journal_lines, 4);
    }

    #[test]
    fn test_watermark_survives_empty_compaction() {
        let dir = TempDir::new().unwrap();
        let mut store = OutboxStore::new(dir.path().join("outbox.jsonl"));
        let e = entry(41, DeliveryStatus::Pending);
        store.append(&[StoreOp::Put { entry: e.clone() }, StoreOp::Remove { id: e.id }]).unwrap();
        store.compact(&[]).unwrap();

        let loaded = OutboxStore::new(store.path()).load().unwrap();
        assert!(loaded.entries.is_empty());
        assert_eq!(loaded.last_seq, 41);
        assert_eq!(loaded.journal_lines, 1);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let good = serde_json::to_string(&StoreOp::Put { entry: entry(5, DeliveryStatus::Pending) }).unwrap();
        let other = serde_json::to_string(&StoreOp::Put { entry: entry(6, DeliveryStatus::Pending) }).unwrap();
        fs::write(&path, format!("{good}\n{{not json\n\n{other}\n")).unwrap();

        let loaded = OutboxStore::new(&path).load().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].event.seq, 5);
    }

    #[tokio::test]
    async fn test_writer_thread_appends_and_flushes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let handle = StoreHandle::spawn(OutboxStore::new(&path), Arc::new(Metrics::new())).unwrap();

        let entries: Vec<OutboxEntry> = (1..=3).map(|seq| entry(seq, DeliveryStatus::Pending)).collect();
        for e in &entries {
            handle.append(vec![StoreOp::Put { entry: e.clone() }]);
        }
        handle.append(vec![StoreOp::Remove { id: entries[0].id }]);
        handle.flush(entries[1..].to_vec()).await.unwrap();

        let loaded = OutboxStore::new(&path).load().unwrap();
        assert_eq!(loaded.entries, entries[1..].to_vec());
        assert_eq!(loaded.last_seq, 3);
    }
}
