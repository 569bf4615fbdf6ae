//! # hexmask
//!
//! Reversible pseudonymization of personally identifiable information.
//!
//! Sensitive record fields are replaced with deterministic keyed pseudonyms
//! before they reach a record store. The plaintext lives in a single shared
//! mapping store, one entry per distinct value, with a counter of how many
//! persisted records reference it. The entry is removed when the last
//! reference goes away.
//!
//! ## Public API
//!
//! - [`MaskingEngine`]: mask / unmask and the mapping reference counting.
//! - [`MaskedRepository`]: plaintext-facing CRUD that runs the engine in the
//!   required order around a [`RecordStore`].
//! - [`MappingStore`] with [`MemoryMappingStore`] and [`SqliteMappingStore`].
//! - [`MaskableRecord`], implemented by [`UserRecord`] and
//!   [`IpAddressRecord`].
//! - [`MaskingConfig`] to assemble an engine at startup.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod keys;
pub mod mapping;
pub mod record;
pub mod repository;
pub mod sqlite;
pub mod users;

pub use audit::{AuditLog, AuditRecord, AuditSink, FileAuditSink, MappingOperation};
pub use config::{KeySource, MaskingConfig, StoreConfig};
pub use engine::{MaskMode, MaskingEngine, ReleasedUse};
pub use error::{MaskError, MaskResult};
pub use hasher::{Hasher, Pseudonym};
pub use keys::MasterKey;
pub use mapping::{MappingEntry, MappingStore, MemoryMappingStore};
pub use record::{FieldKind, FieldSpec, FieldValue, MaskableRecord};
pub use repository::{MaskedRepository, MemoryRecordStore, RecordStore};
pub use sqlite::SqliteMappingStore;
pub use users::{IpAddressRecord, UserRecord};

/// Generate a fresh master key from the system RNG.
///
/// In production the key should come from a secret store via
/// [`MaskingConfig`]; a key generated here must be persisted by the caller,
/// or every pseudonym produced with it becomes unresolvable on restart.
pub fn generate_master_key() -> MaskResult<MasterKey> {
    MasterKey::generate()
}
