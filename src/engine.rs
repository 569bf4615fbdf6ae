//! The masking engine.
//!
//! Owns the increment/decrement protocol against the mapping store:
//! - `mask` swaps every specified masked field for its pseudonym and
//!   registers one use of each newly adopted value.
//! - `unmask` resolves pseudonyms back to plaintext.
//! - `decrement_mapping_for_update` / `decrement_mapping_for_delete` release
//!   uses of values a record is about to stop referencing.
//!
//! Required order for one record: decrement (if any) -> mask -> record store
//! write. Counter changes go through the store's atomic primitives and are
//! scoped to a single pseudonym; nothing is locked across fields. A mask or
//! decrement that fails partway undoes its own earlier changes, best effort.
//! If an undo itself fails, counts err on the high side: an orphaned entry,
//! never a missing one.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::audit::{AuditLog, AuditRecord, AuditSink, MappingOperation};
use crate::error::{MaskError, MaskResult};
use crate::hasher::{Hasher, Pseudonym};
use crate::mapping::MappingStore;
use crate::record::{field_name, FieldValue, MaskableRecord};

/// How a mask call relates to what is already persisted.
#[derive(Debug)]
pub enum MaskMode<'a, R> {
    /// A brand-new record: every specified masked value registers a use.
    Create,
    /// A partial update of `previous` (the persisted, masked row). Only
    /// values that differ from `previous` register a use; unchanged values
    /// already hold one.
    Update { previous: &'a R },
}

impl<R> Clone for MaskMode<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for MaskMode<'_, R> {}

/// One mapping use given up by a decrement: the pseudonym and the plaintext
/// needed to register it again.
#[derive(Clone, PartialEq, Eq)]
pub struct ReleasedUse {
    pub pseudonym: Pseudonym,
    pub plaintext: String,
}

impl std::fmt::Debug for ReleasedUse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasedUse")
            .field("pseudonym", &self.pseudonym)
            .field("plaintext", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct MaskingEngine {
    hasher: Hasher,
    store: Arc<dyn MappingStore>,
    audit: Arc<Mutex<AuditLog>>,
}

impl std::fmt::Debug for MaskingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskingEngine")
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}

impl MaskingEngine {
    pub fn new(hasher: Hasher, store: Arc<dyn MappingStore>) -> Self {
        Self {
            hasher,
            store,
            audit: Arc::new(Mutex::new(AuditLog::new())),
        }
    }

    /// Keep at most `capacity` audit records in memory (see
    /// [`AuditLog::with_capacity`]). Starts a fresh log, so call it before
    /// attaching sinks.
    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit = Arc::new(Mutex::new(AuditLog::with_capacity(capacity)));
        self
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    pub fn mapping_store(&self) -> &Arc<dyn MappingStore> {
        &self.store
    }

    /// Forward every future audit record to `sink` as well.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) -> MaskResult<()> {
        let mut log = self
            .audit
            .lock()
            .map_err(|_| MaskError::Store("audit log lock poisoned".into()))?;
        log.add_forward_sink(sink);
        Ok(())
    }

    /// Snapshot of the audit trail so far.
    pub fn audit_records(&self) -> MaskResult<Vec<AuditRecord>> {
        let log = self
            .audit
            .lock()
            .map_err(|_| MaskError::Store("audit log lock poisoned".into()))?;
        Ok(log.iter().cloned().collect())
    }

    /// Pseudonym of `plaintext`, for lookups. Touches no store.
    pub fn mask_string(&self, plaintext: &str) -> Pseudonym {
        self.hasher.hash(plaintext)
    }

    /// Replace every specified masked field of `record` with its pseudonym.
    ///
    /// The record is consumed; on error nothing partially masked is handed
    /// back and the uses registered so far are released again. Masking a
    /// record that is already flagged masked is rejected, so one logical
    /// write cannot count a value twice.
    pub async fn mask<R: MaskableRecord>(&self, record: R, mode: MaskMode<'_, R>) -> MaskResult<R> {
        R::validate_schema()?;
        if record.is_masked() {
            return Err(MaskError::InvalidArgument("record is already masked".into()));
        }
        if let MaskMode::Update { previous } = mode {
            require_masked(previous)?;
        }

        let mut masked = record;
        let mut registered = Vec::new();
        for index in R::masked_field_indices() {
            if let Err(err) = self.mask_field(&mut masked, index, mode, &mut registered).await {
                self.unwind_registered(&registered).await;
                return Err(err);
            }
        }
        masked.set_masked(true);
        Ok(masked)
    }

    async fn mask_field<R: MaskableRecord>(
        &self,
        record: &mut R,
        index: usize,
        mode: MaskMode<'_, R>,
        registered: &mut Vec<Pseudonym>,
    ) -> MaskResult<()> {
        let Some(plaintext) = record.text_field(index)? else {
            return Ok(());
        };
        let pseudonym = self.hasher.hash(&plaintext);

        let adopts_new_value = match mode {
            MaskMode::Create => true,
            MaskMode::Update { previous } => {
                previous.text_field(index)?.as_deref() != Some(pseudonym.as_str())
            }
        };
        if adopts_new_value {
            self.register(&pseudonym, &plaintext).await?;
            registered.push(pseudonym.clone());
        }

        record.set_field(index, Some(FieldValue::Text(pseudonym.into_string())))
    }

    /// Resolve every masked field of `record` back to plaintext.
    ///
    /// A pseudonym without a mapping entry is an integrity violation and is
    /// returned as `NotFound`, never defaulted.
    pub async fn unmask<R: MaskableRecord>(&self, record: R) -> MaskResult<R> {
        R::validate_schema()?;
        if !record.is_masked() {
            return Err(MaskError::InvalidArgument("record is not masked".into()));
        }

        let mut plain = record;
        for index in R::masked_field_indices() {
            let Some(stored) = plain.text_field(index)? else {
                continue;
            };
            let pseudonym = Pseudonym::from_stored(stored);
            let entry = self
                .store
                .read_by_key(&pseudonym)
                .await
                .map_err(|e| in_field::<R>(index, e))?;
            plain.set_field(index, Some(FieldValue::Text(entry.plaintext)))?;
        }
        plain.set_masked(false);
        Ok(plain)
    }

    /// Release the old values of masked fields that `update` is about to
    /// change. Fields left unspecified in `update`, or set to the value
    /// already persisted, are not touched.
    ///
    /// Must run before [`MaskingEngine::mask`] registers the replacement
    /// values. Returns what was released, for
    /// [`MaskingEngine::restore_released`] should the record write fail. If a
    /// field cannot be released, the earlier fields are restored first.
    pub async fn decrement_mapping_for_update<R: MaskableRecord>(
        &self,
        update: &R,
        previous: &R,
    ) -> MaskResult<Vec<ReleasedUse>> {
        R::validate_schema()?;
        require_masked(previous)?;

        let mut released = Vec::new();
        for index in R::masked_field_indices() {
            let Some(new_value) = update.text_field(index)? else {
                continue;
            };
            let Some(old_value) = previous.text_field(index)? else {
                continue;
            };
            let new_pseudonym = if update.is_masked() {
                Pseudonym::from_stored(new_value)
            } else {
                self.hasher.hash(&new_value)
            };
            if new_pseudonym.as_str() == old_value {
                continue;
            }
            self.release_field::<R>(index, Pseudonym::from_stored(old_value), &mut released)
                .await?;
        }
        Ok(released)
    }

    /// Release every masked value of a record about to be deleted. Must run
    /// before the record itself is removed. Returns what was released.
    pub async fn decrement_mapping_for_delete<R: MaskableRecord>(
        &self,
        persisted: &R,
    ) -> MaskResult<Vec<ReleasedUse>> {
        R::validate_schema()?;
        require_masked(persisted)?;

        let mut released = Vec::new();
        for index in R::masked_field_indices() {
            let Some(stored) = persisted.text_field(index)? else {
                continue;
            };
            self.release_field::<R>(index, Pseudonym::from_stored(stored), &mut released)
                .await?;
        }
        Ok(released)
    }

    /// Register the released uses again, after the record write they were
    /// released for has failed. Every use is attempted; the first error is
    /// returned.
    pub async fn restore_released(&self, released: &[ReleasedUse]) -> MaskResult<()> {
        let mut first_err = None;
        for used in released {
            if let Err(err) = self.register(&used.pseudonym, &used.plaintext).await {
                warn!(pseudonym = %used.pseudonym.short(), error = %err, "failed to restore mapping use");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Release the uses an update-mode [`MaskingEngine::mask`] registered:
    /// every specified masked field of `masked` whose value differs from
    /// `previous`. Used when the record write after masking fails.
    pub async fn release_adopted<R: MaskableRecord>(
        &self,
        masked: &R,
        previous: &R,
    ) -> MaskResult<usize> {
        R::validate_schema()?;
        require_masked(masked)?;
        require_masked(previous)?;

        let mut released = 0;
        for index in R::masked_field_indices() {
            let Some(new_value) = masked.text_field(index)? else {
                continue;
            };
            if previous.text_field(index)?.as_deref() == Some(new_value.as_str()) {
                continue;
            }
            self.release(&Pseudonym::from_stored(new_value))
                .await
                .map_err(|e| in_field::<R>(index, e))?;
            released += 1;
        }
        Ok(released)
    }

    /// Read the plaintext of `pseudonym`, then release one use of it. On
    /// failure everything already in `released` is registered again.
    async fn release_field<R: MaskableRecord>(
        &self,
        index: usize,
        pseudonym: Pseudonym,
        released: &mut Vec<ReleasedUse>,
    ) -> MaskResult<()> {
        let step = async {
            let entry = self.store.read_by_key(&pseudonym).await?;
            self.release(&pseudonym).await?;
            Ok::<_, MaskError>(entry.plaintext)
        };
        let outcome = step.await;
        match outcome {
            Ok(plaintext) => {
                released.push(ReleasedUse { pseudonym, plaintext });
                Ok(())
            }
            Err(err) => {
                if let Err(restore_err) = self.restore_released(released).await {
                    warn!(error = %restore_err, "failed to restore uses after aborted release");
                }
                released.clear();
                Err(in_field::<R>(index, err))
            }
        }
    }

    async fn unwind_registered(&self, registered: &[Pseudonym]) {
        for pseudonym in registered.iter().rev() {
            if let Err(err) = self.release(pseudonym).await {
                warn!(pseudonym = %pseudonym.short(), error = %err, "failed to release use after aborted mask; entry left orphaned");
            }
        }
    }

    async fn register(&self, pseudonym: &Pseudonym, plaintext: &str) -> MaskResult<()> {
        let occurrences = self.store.increment_or_create(pseudonym, plaintext).await?;
        let operation = if occurrences == 1 {
            MappingOperation::Created
        } else {
            MappingOperation::Incremented
        };
        debug!(pseudonym = %pseudonym.short(), occurrences, ?operation, "registered mapping use");
        self.record(operation, pseudonym, occurrences);
        Ok(())
    }

    async fn release(&self, pseudonym: &Pseudonym) -> MaskResult<()> {
        let occurrences = self.store.decrement_or_delete(pseudonym).await?;
        let operation = if occurrences == 0 {
            MappingOperation::Deleted
        } else {
            MappingOperation::Decremented
        };
        debug!(pseudonym = %pseudonym.short(), occurrences, ?operation, "released mapping use");
        self.record(operation, pseudonym, occurrences);
        Ok(())
    }

    fn record(&self, operation: MappingOperation, pseudonym: &Pseudonym, occurrences: u64) {
        match self.audit.lock() {
            Ok(mut log) => log.append(AuditRecord::now(operation, pseudonym.clone(), occurrences)),
            Err(_) => warn!(pseudonym = %pseudonym.short(), "audit log lock poisoned; record dropped"),
        }
    }
}

fn require_masked<R: MaskableRecord>(record: &R) -> MaskResult<()> {
    if record.is_masked() {
        Ok(())
    } else {
        Err(MaskError::InvalidArgument(
            "persisted record must be masked".into(),
        ))
    }
}

fn in_field<R: MaskableRecord>(index: usize, err: MaskError) -> MaskError {
    match err {
        MaskError::NotFound(msg) => {
            MaskError::NotFound(format!("field {}: {}", field_name::<R>(index), msg))
        }
        other => other,
    }
}
