//! Record stores and the masked repository on top of them.
//!
//! A [`RecordStore`] persists masked rows of one record type and never sees
//! plaintext for masked fields. [`MaskedRepository`] is what business code
//! calls: it takes plaintext records and runs the masking protocol in the
//! required order around every store write.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::engine::{MaskMode, MaskingEngine, ReleasedUse};
use crate::error::{MaskError, MaskResult};
use crate::record::{FieldValue, MaskableRecord};

#[async_trait]
pub trait RecordStore<R: MaskableRecord>: Send + Sync {
    /// Insert a masked record. `DuplicateKey` if its key is taken.
    async fn create(&self, record: R) -> MaskResult<()>;

    /// `NotFound` if absent.
    async fn read_by_key(&self, key: &str) -> MaskResult<R>;

    /// Overwrite the specified fields of an existing row.
    async fn update(&self, record: R) -> MaskResult<()>;

    /// Remove every listed row. `NotFound` (and nothing removed) if any is
    /// absent.
    async fn delete_by_keys(&self, keys: &[String]) -> MaskResult<()>;

    async fn exists_by_key(&self, key: &str) -> MaskResult<bool>;

    /// Whether any row holds `value` in field `index`.
    async fn exists_by_field(&self, index: usize, value: &FieldValue) -> MaskResult<bool>;
}

fn reject_plaintext<R: MaskableRecord>(record: &R) -> MaskResult<()> {
    if !record.is_masked() && record.has_sensitive_values() {
        return Err(MaskError::InvalidArgument(
            "refusing to persist an unmasked record with sensitive fields".into(),
        ));
    }
    Ok(())
}

fn required_key<R: MaskableRecord>(record: &R) -> MaskResult<String> {
    record
        .key()
        .ok_or_else(|| MaskError::InvalidArgument("record has no key".into()))
}

// ---------------------------------------------------------------------------
// In-memory record store
// ---------------------------------------------------------------------------

/// Process-local record store, ordered by key.
#[derive(Debug)]
pub struct MemoryRecordStore<R> {
    rows: RwLock<BTreeMap<String, R>>,
}

impl<R> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<R: MaskableRecord> MemoryRecordStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Every stored row, in key order, exactly as persisted.
    pub async fn rows(&self) -> Vec<R> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl<R: MaskableRecord> RecordStore<R> for MemoryRecordStore<R> {
    async fn create(&self, record: R) -> MaskResult<()> {
        reject_plaintext(&record)?;
        let key = required_key(&record)?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(&key) {
            return Err(MaskError::DuplicateKey("record key already exists".into()));
        }
        rows.insert(key, record);
        Ok(())
    }

    async fn read_by_key(&self, key: &str) -> MaskResult<R> {
        self.rows
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| MaskError::NotFound("record does not exist".into()))
    }

    async fn update(&self, record: R) -> MaskResult<()> {
        reject_plaintext(&record)?;
        let key = required_key(&record)?;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&key)
            .ok_or_else(|| MaskError::NotFound("record does not exist".into()))?;
        row.merge_from(&record)
    }

    async fn delete_by_keys(&self, keys: &[String]) -> MaskResult<()> {
        let mut rows = self.rows.write().await;
        if keys.iter().any(|k| !rows.contains_key(k)) {
            return Err(MaskError::NotFound("record does not exist".into()));
        }
        for key in keys {
            rows.remove(key);
        }
        Ok(())
    }

    async fn exists_by_key(&self, key: &str) -> MaskResult<bool> {
        Ok(self.rows.read().await.contains_key(key))
    }

    async fn exists_by_field(&self, index: usize, value: &FieldValue) -> MaskResult<bool> {
        if index >= R::SCHEMA.len() {
            return Err(MaskError::InvalidArgument(format!("field {index} out of range")));
        }
        let rows = self.rows.read().await;
        Ok(rows.values().any(|row| row.field(index).as_ref() == Some(value)))
    }
}

// ---------------------------------------------------------------------------
// Per-record serialization
// ---------------------------------------------------------------------------

/// One async mutex per record key, created on demand and dropped once no
/// task holds or waits on it.
#[derive(Default)]
struct RecordLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct RecordGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLocks {
    async fn lock(&self, key: &str) -> RecordGuard<'_> {
        let lock = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        RecordGuard {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        // Release before pruning so the count reflects only other holders.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ---------------------------------------------------------------------------
// Masked repository
// ---------------------------------------------------------------------------

/// Plaintext-facing CRUD over a record store.
///
/// Mutations of the same record are serialized; mutations of different
/// records run concurrently and meet only at the mapping store's per-key
/// atomic primitives.
pub struct MaskedRepository<R, S> {
    engine: MaskingEngine,
    records: S,
    locks: RecordLocks,
    _record: PhantomData<fn() -> R>,
}

impl<R, S> MaskedRepository<R, S>
where
    R: MaskableRecord,
    S: RecordStore<R>,
{
    pub fn new(engine: MaskingEngine, records: S) -> MaskResult<Self> {
        R::validate_schema()?;
        Ok(Self {
            engine,
            records,
            locks: RecordLocks::default(),
            _record: PhantomData,
        })
    }

    pub fn engine(&self) -> &MaskingEngine {
        &self.engine
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    /// Store key for a plaintext key value.
    pub fn lookup_key(&self, plaintext_key: &str) -> String {
        if R::SCHEMA.get(R::KEY_FIELD).is_some_and(|spec| spec.masked) {
            self.engine.mask_string(plaintext_key).into_string()
        } else {
            plaintext_key.to_string()
        }
    }

    /// Mask and persist a new record. Returns its store key.
    ///
    /// If the store rejects the row after masking, the uses just registered
    /// are released again.
    pub async fn create(&self, record: R) -> MaskResult<String> {
        let plaintext_key = plaintext_key(&record)?;
        let key = self.lookup_key(&plaintext_key);
        let _guard = self.locks.lock(&key).await;

        if self.records.exists_by_key(&key).await? {
            return Err(MaskError::DuplicateKey("record key already exists".into()));
        }

        let masked = self.engine.mask(record, MaskMode::Create).await?;
        if let Err(err) = self.records.create(masked.clone()).await {
            warn!(error = %err, "record store rejected masked record; releasing mapping uses");
            if let Err(release_err) = self.engine.decrement_mapping_for_delete(&masked).await {
                warn!(error = %release_err, "failed to release mapping uses; entries left orphaned");
            }
            return Err(err);
        }
        debug!(key = %short(&key), "record created");
        Ok(key)
    }

    /// Create several records. Every key is checked before anything is
    /// written, including for repeats within the batch; the first failing
    /// write stops the batch.
    pub async fn create_many(&self, records: Vec<R>) -> MaskResult<Vec<String>> {
        let mut batch = BTreeSet::new();
        for record in &records {
            let key = self.lookup_key(&plaintext_key(record)?);
            if !batch.insert(key.clone()) {
                return Err(MaskError::DuplicateKey("record key repeated in batch".into()));
            }
            if self.records.exists_by_key(&key).await? {
                return Err(MaskError::DuplicateKey("record key already exists".into()));
            }
        }

        let total = records.len();
        let mut keys = Vec::with_capacity(total);
        for record in records {
            keys.push(self.create(record).await?);
        }
        info!(count = total, "bulk create completed");
        Ok(keys)
    }

    /// Read and unmask the record with the given plaintext key.
    pub async fn read(&self, plaintext_key: &str) -> MaskResult<R> {
        let key = self.lookup_key(plaintext_key);
        let persisted = self.records.read_by_key(&key).await?;
        self.engine.unmask(persisted).await
    }

    /// Apply a partial update. Only specified fields change; masked fields
    /// whose value really changes have their old mapping released first.
    pub async fn update(&self, update: R) -> MaskResult<()> {
        let plaintext_key = plaintext_key(&update)?;
        let key = self.lookup_key(&plaintext_key);
        let _guard = self.locks.lock(&key).await;

        let previous = self.records.read_by_key(&key).await?;
        let released = self
            .engine
            .decrement_mapping_for_update(&update, &previous)
            .await?;
        let masked = match self
            .engine
            .mask(update, MaskMode::Update { previous: &previous })
            .await
        {
            Ok(masked) => masked,
            Err(err) => {
                self.restore(&released).await;
                return Err(err);
            }
        };
        if let Err(err) = self.records.update(masked.clone()).await {
            warn!(error = %err, "record store rejected update; restoring mapping uses");
            if let Err(release_err) = self.engine.release_adopted(&masked, &previous).await {
                warn!(error = %release_err, "failed to release new mapping uses; entries left orphaned");
            }
            self.restore(&released).await;
            return Err(err);
        }
        debug!(key = %short(&key), "record updated");
        Ok(())
    }

    /// Update several records in order; the first failure stops the batch.
    pub async fn update_many(&self, updates: Vec<R>) -> MaskResult<()> {
        let total = updates.len();
        for update in updates {
            self.update(update).await?;
        }
        info!(count = total, "bulk update completed");
        Ok(())
    }

    /// Release the record's mapping uses, then remove it.
    pub async fn delete(&self, plaintext_key: &str) -> MaskResult<()> {
        let key = self.lookup_key(plaintext_key);
        let _guard = self.locks.lock(&key).await;

        let persisted = self.records.read_by_key(&key).await?;
        let released = self.engine.decrement_mapping_for_delete(&persisted).await?;
        if let Err(err) = self.records.delete_by_keys(std::slice::from_ref(&key)).await {
            warn!(error = %err, "record store rejected delete; restoring mapping uses");
            self.restore(&released).await;
            return Err(err);
        }
        debug!(key = %short(&key), "record deleted");
        Ok(())
    }

    /// Delete several records. Every key is checked before anything is
    /// released, including for repeats within the batch.
    pub async fn delete_many(&self, plaintext_keys: &[&str]) -> MaskResult<()> {
        let mut batch = BTreeSet::new();
        for plaintext_key in plaintext_keys {
            if !batch.insert(*plaintext_key) {
                return Err(MaskError::InvalidArgument("record key repeated in batch".into()));
            }
            if !self.exists(plaintext_key).await? {
                return Err(MaskError::NotFound("record does not exist".into()));
            }
        }
        for plaintext_key in plaintext_keys {
            self.delete(plaintext_key).await?;
        }
        info!(count = plaintext_keys.len(), "bulk delete completed");
        Ok(())
    }

    async fn restore(&self, released: &[ReleasedUse]) {
        if let Err(err) = self.engine.restore_released(released).await {
            warn!(error = %err, "failed to restore released mapping uses; record may reference missing entries");
        }
    }

    pub async fn exists(&self, plaintext_key: &str) -> MaskResult<bool> {
        self.records.exists_by_key(&self.lookup_key(plaintext_key)).await
    }

    /// Exact-match search on any field; masked fields are compared by
    /// pseudonym, so no plaintext reaches the store.
    pub async fn exists_by_field(&self, index: usize, value: FieldValue) -> MaskResult<bool> {
        let spec = R::SCHEMA
            .get(index)
            .ok_or_else(|| MaskError::InvalidArgument(format!("field {index} out of range")))?;
        let value = match value {
            FieldValue::Text(plaintext) if spec.masked => {
                FieldValue::Text(self.engine.mask_string(&plaintext).into_string())
            }
            other => other,
        };
        self.records.exists_by_field(index, &value).await
    }
}

fn plaintext_key<R: MaskableRecord>(record: &R) -> MaskResult<String> {
    if record.is_masked() {
        return Err(MaskError::InvalidArgument(
            "repository expects plaintext records".into(),
        ));
    }
    required_key(record)
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Hasher;
    use crate::keys::MasterKey;
    use crate::mapping::MemoryMappingStore;
    use crate::users::UserRecord;

    fn repository() -> MaskedRepository<UserRecord, MemoryRecordStore<UserRecord>> {
        let hasher = Hasher::new(&MasterKey::from_bytes([8u8; 32])).unwrap();
        let engine = MaskingEngine::new(hasher, Arc::new(MemoryMappingStore::new()));
        MaskedRepository::new(engine, MemoryRecordStore::new()).unwrap()
    }

    #[tokio::test]
    async fn test_store_never_holds_plaintext() {
        let repo = repository();
        repo.create(UserRecord::new("alice").with_email("a@x.com"))
            .await
            .unwrap();

        let rows = repo.records().rows().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_masked());
        assert_ne!(rows[0].username.as_deref(), Some("alice"));
        assert_ne!(rows[0].email.as_deref(), Some("a@x.com"));
    }

    #[tokio::test]
    async fn test_record_store_rejects_unmasked_sensitive_rows() {
        let store = MemoryRecordStore::<UserRecord>::new();
        let err = store.create(UserRecord::new("alice")).await.unwrap_err();
        assert!(matches!(err, MaskError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_counts_alone() {
        let repo = repository();
        repo.create(UserRecord::new("alice")).await.unwrap();
        let err = repo.create(UserRecord::new("alice")).await.unwrap_err();
        assert!(matches!(err, MaskError::DuplicateKey(_)));

        let entry = repo
            .engine()
            .mapping_store()
            .read_by_key(&repo.engine().mask_string("alice"))
            .await
            .unwrap();
        assert_eq!(entry.occurrences, 1);
    }

    #[tokio::test]
    async fn test_read_missing_record() {
        let repo = repository();
        assert!(matches!(repo.read("ghost").await, Err(MaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_exists_by_masked_field() {
        let repo = repository();
        repo.create(UserRecord::new("alice").with_phone_number("555-0100"))
            .await
            .unwrap();
        assert!(repo
            .exists_by_field(UserRecord::PHONE_NUMBER, FieldValue::Text("555-0100".into()))
            .await
            .unwrap());
        assert!(!repo
            .exists_by_field(UserRecord::PHONE_NUMBER, FieldValue::Text("555-0199".into()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_pruned() {
        let repo = repository();
        repo.create(UserRecord::new("alice")).await.unwrap();
        repo.delete("alice").await.unwrap();
        assert!(repo.locks.locks.is_empty());
    }
}
