//! Append-only audit trail of mapping-store mutations.
//!
//! Every counter change made by the engine is recorded with the pseudonym it
//! touched and the resulting count. Plaintext is never recorded. The
//! in-memory log keeps only the most recent records; the full trail belongs
//! in a forward sink (file, database, ...).

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hasher::Pseudonym;

/// A sink that receives audit records.
pub trait AuditSink: Send {
    /// Called for every mapping mutation.
    fn append(&mut self, record: AuditRecord);
}

/// What happened to a mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOperation {
    /// First use of a plaintext; entry created with a count of 1.
    Created,
    Incremented,
    Decremented,
    /// Count reached zero; entry removed.
    Deleted,
}

/// A permanent record of one mapping mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation: MappingOperation,
    pub pseudonym: Pseudonym,
    /// Occurrence count after the operation.
    pub occurrences: u64,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn now(operation: MappingOperation, pseudonym: Pseudonym, occurrences: u64) -> Self {
        Self {
            operation,
            pseudonym,
            occurrences,
            timestamp: Utc::now(),
        }
    }
}

/// Records kept in memory when no capacity is given.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// An append-only log of mapping mutations, bounded in memory. Once full,
/// the oldest record is dropped for each new one. Forward sinks see every
/// record regardless.
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("capacity", &self.capacity)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that keeps at most `capacity` records in memory. A capacity of
    /// zero keeps none and only forwards.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            forward_sinks: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a sink to receive a copy of every record, without replacing the
    /// in-memory log.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Records touching one pseudonym, oldest first.
    pub fn history(&self, pseudonym: &Pseudonym) -> Vec<AuditRecord> {
        self.records
            .iter()
            .filter(|r| &r.pseudonym == pseudonym)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
///
/// Writes happen on a dedicated thread, so `append` never blocks on disk.
/// Dropping the sink waits for queued records to be written.
pub struct FileAuditSink {
    sender: Option<mpsc::Sender<AuditRecord>>,
    writer: Option<JoinHandle<()>>,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = mpsc::channel::<AuditRecord>();
        let writer = thread::Builder::new()
            .name("hexmask-audit".into())
            .spawn(move || write_records(file, receiver))?;
        Ok(Self {
            sender: Some(sender),
            writer: Some(writer),
        })
    }
}

fn write_records(file: std::fs::File, receiver: mpsc::Receiver<AuditRecord>) {
    let mut out = BufWriter::new(file);
    while let Ok(record) = receiver.recv() {
        let mut written = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(out, "{line}"));
        // Flush once the queue is drained.
        for queued in receiver.try_iter() {
            written = written.and_then(|_| {
                let line = serde_json::to_string(&queued).map_err(std::io::Error::from)?;
                writeln!(out, "{line}")
            });
        }
        if let Err(e) = written.and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write audit record");
        }
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(record).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("audit writer thread has stopped; record dropped");
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("audit writer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_by_pseudonym() {
        let mut log = AuditLog::new();
        let a = Pseudonym::from_stored("aaa");
        let b = Pseudonym::from_stored("bbb");
        log.append(AuditRecord::now(MappingOperation::Created, a.clone(), 1));
        log.append(AuditRecord::now(MappingOperation::Created, b.clone(), 1));
        log.append(AuditRecord::now(MappingOperation::Deleted, a.clone(), 0));

        let ops: Vec<_> = log.history(&a).iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec![MappingOperation::Created, MappingOperation::Deleted]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_log_keeps_only_most_recent_records() {
        let mut log = AuditLog::with_capacity(2);
        for n in 1..=5 {
            log.append(AuditRecord::now(
                MappingOperation::Incremented,
                Pseudonym::from_stored("p"),
                n,
            ));
        }
        let counts: Vec<_> = log.iter().map(|r| r.occurrences).collect();
        assert_eq!(counts, vec![4, 5]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_zero_capacity_still_forwards() {
        struct Counter(std::sync::Arc<std::sync::atomic::AtomicUsize>);
        impl AuditSink for Counter {
            fn append(&mut self, _record: AuditRecord) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut log = AuditLog::with_capacity(0);
        log.add_forward_sink(Box::new(Counter(seen.clone())));
        log.append(AuditRecord::now(MappingOperation::Created, Pseudonym::from_stored("p"), 1));
        assert!(log.is_empty());
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_record_serializes_snake_case() {
        let record = AuditRecord::now(MappingOperation::Incremented, Pseudonym::from_stored("p"), 2);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"operation\":\"incremented\""));
        assert!(json.contains("\"pseudonym\":\"p\""));
    }
}
