//! Tests for the pluggable AuditSink / forward sink functionality.

use std::io::BufRead;
use std::sync::{Arc, Mutex};

use hexmask::audit::{AuditRecord, AuditSink, FileAuditSink, MappingOperation};
use hexmask::{
    generate_master_key, Hasher, MaskMode, MaskingEngine, MemoryMappingStore, UserRecord,
};

/// A test sink that collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn engine() -> MaskingEngine {
    let hasher = Hasher::new(&generate_master_key().unwrap()).unwrap();
    MaskingEngine::new(hasher, Arc::new(MemoryMappingStore::new()))
}

#[tokio::test]
async fn test_forward_sink_receives_records() {
    let engine = engine();
    let records = Arc::new(Mutex::new(Vec::new()));
    engine
        .add_audit_sink(Box::new(SharedVecSink {
            records: Arc::clone(&records),
        }))
        .unwrap();

    engine
        .mask(UserRecord::new("alice"), MaskMode::Create)
        .await
        .unwrap();
    engine
        .mask(UserRecord::new("alice"), MaskMode::Create)
        .await
        .unwrap();

    // Primary log has both records
    assert_eq!(engine.audit_records().unwrap().len(), 2);

    // Forward sink also received them
    let collected = records.lock().unwrap();
    let ops: Vec<_> = collected.iter().map(|r| r.operation).collect();
    assert_eq!(ops, vec![MappingOperation::Created, MappingOperation::Incremented]);
    assert_eq!(collected[1].occurrences, 2);
    assert_eq!(collected[0].pseudonym, engine.mask_string("alice"));
}

#[tokio::test]
async fn test_file_sink_writes_jsonl_without_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let engine = engine();
    engine
        .add_audit_sink(Box::new(FileAuditSink::new(&path).unwrap()))
        .unwrap();

    let masked = engine
        .mask(
            UserRecord::new("bob").with_email("bob@example.com"),
            MaskMode::Create,
        )
        .await
        .unwrap();
    engine.decrement_mapping_for_delete(&masked).await.unwrap();
    // Dropping the engine drops the sink, which flushes its writer thread.
    drop(engine);

    let file = std::fs::File::open(&path).unwrap();
    let lines: Vec<String> = std::io::BufReader::new(file)
        .lines()
        .map(|l| l.unwrap())
        .collect();
    assert_eq!(lines.len(), 4);

    for line in &lines {
        assert!(!line.contains("bob@example.com"));
        let record: AuditRecord = serde_json::from_str(line).unwrap();
        assert!(matches!(
            record.operation,
            MappingOperation::Created | MappingOperation::Deleted
        ));
    }
}
