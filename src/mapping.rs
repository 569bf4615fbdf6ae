//! The shared pseudonym -> plaintext mapping store.
//!
//! One entry per distinct plaintext, keyed by its pseudonym, with a counter
//! of how many persisted records currently reference it. An entry exists iff
//! its counter is positive.
//!
//! Besides the point operations (`exists`, `create`, `read_by_key`, `update`,
//! `delete_by_keys`) every store provides two atomic primitives,
//! [`MappingStore::increment_or_create`] and
//! [`MappingStore::decrement_or_delete`]. The engine only mutates counters
//! through these, so concurrent writers sharing a plaintext never race on a
//! check-then-act sequence.

use std::fmt;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{MaskError, MaskResult};
use crate::hasher::Pseudonym;

/// A row of the mapping store.
#[derive(Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub pseudonym: Pseudonym,
    pub plaintext: String,
    pub occurrences: u64,
}

impl fmt::Debug for MappingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingEntry")
            .field("pseudonym", &self.pseudonym)
            .field("plaintext", &"[REDACTED]")
            .field("occurrences", &self.occurrences)
            .finish()
    }
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn exists(&self, pseudonym: &Pseudonym) -> MaskResult<bool>;

    /// Insert a new entry. `DuplicateKey` if the pseudonym is already present.
    async fn create(&self, pseudonym: &Pseudonym, plaintext: &str, occurrences: u64)
        -> MaskResult<()>;

    /// `NotFound` if absent.
    async fn read_by_key(&self, pseudonym: &Pseudonym) -> MaskResult<MappingEntry>;

    /// Overwrite the counter of an existing entry. The plaintext is immutable.
    async fn update(&self, pseudonym: &Pseudonym, occurrences: u64) -> MaskResult<()>;

    /// Remove every listed entry. `NotFound` (and nothing removed) if any is
    /// absent.
    async fn delete_by_keys(&self, pseudonyms: &[Pseudonym]) -> MaskResult<()>;

    /// Atomically register one more use of `plaintext`, creating the entry
    /// with a count of 1 on first use. Returns the new count.
    async fn increment_or_create(&self, pseudonym: &Pseudonym, plaintext: &str)
        -> MaskResult<u64>;

    /// Atomically release one use. The entry is removed by whichever call
    /// takes the count to zero. Returns the new count; `NotFound` if absent.
    async fn decrement_or_delete(&self, pseudonym: &Pseudonym) -> MaskResult<u64>;

    /// Number of live entries.
    async fn len(&self) -> MaskResult<usize>;
}

pub(crate) fn not_found(pseudonym: &Pseudonym) -> MaskError {
    MaskError::NotFound(format!("no mapping for pseudonym {}", pseudonym.short()))
}

pub(crate) fn collision(pseudonym: &Pseudonym) -> MaskError {
    MaskError::DuplicateKey(format!(
        "pseudonym {} already maps to a different value",
        pseudonym.short()
    ))
}

pub(crate) fn zero_count(pseudonym: &Pseudonym) -> MaskError {
    MaskError::InvalidArgument(format!(
        "occurrence count for {} must be positive; delete the entry instead",
        pseudonym.short()
    ))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local mapping store. Each key's read-modify-write runs under the
/// shard lock held by the map entry, so per-pseudonym updates serialize.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    entries: DashMap<Pseudonym, MappingEntry>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn exists(&self, pseudonym: &Pseudonym) -> MaskResult<bool> {
        Ok(self.entries.contains_key(pseudonym))
    }

    async fn create(
        &self,
        pseudonym: &Pseudonym,
        plaintext: &str,
        occurrences: u64,
    ) -> MaskResult<()> {
        if occurrences == 0 {
            return Err(zero_count(pseudonym));
        }
        match self.entries.entry(pseudonym.clone()) {
            Entry::Occupied(_) => Err(MaskError::DuplicateKey(format!(
                "pseudonym {} already exists",
                pseudonym.short()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(MappingEntry {
                    pseudonym: pseudonym.clone(),
                    plaintext: plaintext.to_string(),
                    occurrences,
                });
                Ok(())
            }
        }
    }

    async fn read_by_key(&self, pseudonym: &Pseudonym) -> MaskResult<MappingEntry> {
        self.entries
            .get(pseudonym)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(pseudonym))
    }

    async fn update(&self, pseudonym: &Pseudonym, occurrences: u64) -> MaskResult<()> {
        if occurrences == 0 {
            return Err(zero_count(pseudonym));
        }
        let mut entry = self
            .entries
            .get_mut(pseudonym)
            .ok_or_else(|| not_found(pseudonym))?;
        entry.occurrences = occurrences;
        Ok(())
    }

    async fn delete_by_keys(&self, pseudonyms: &[Pseudonym]) -> MaskResult<()> {
        if let Some(missing) = pseudonyms.iter().find(|p| !self.entries.contains_key(*p)) {
            return Err(not_found(missing));
        }
        for pseudonym in pseudonyms {
            self.entries.remove(pseudonym);
        }
        Ok(())
    }

    async fn increment_or_create(
        &self,
        pseudonym: &Pseudonym,
        plaintext: &str,
    ) -> MaskResult<u64> {
        match self.entries.entry(pseudonym.clone()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.plaintext != plaintext {
                    return Err(collision(pseudonym));
                }
                entry.occurrences += 1;
                Ok(entry.occurrences)
            }
            Entry::Vacant(slot) => {
                slot.insert(MappingEntry {
                    pseudonym: pseudonym.clone(),
                    plaintext: plaintext.to_string(),
                    occurrences: 1,
                });
                Ok(1)
            }
        }
    }

    async fn decrement_or_delete(&self, pseudonym: &Pseudonym) -> MaskResult<u64> {
        match self.entries.entry(pseudonym.clone()) {
            Entry::Occupied(slot) if slot.get().occurrences <= 1 => {
                slot.remove();
                Ok(0)
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.occurrences -= 1;
                Ok(entry.occurrences)
            }
            Entry::Vacant(_) => Err(not_found(pseudonym)),
        }
    }

    async fn len(&self) -> MaskResult<usize> {
        Ok(self.entries.len())
    }
}
