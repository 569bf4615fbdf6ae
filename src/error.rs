//! Error types for hexmask.
//!
//! Every variant is a distinct failure mode of the masking layer. Messages
//! identify the pseudonym or field involved and never carry a plaintext value.

use thiserror::Error;

/// Result type for all hexmask operations.
pub type MaskResult<T> = Result<T, MaskError>;

/// The single error type for all hexmask operations.
#[derive(Debug, Error)]
pub enum MaskError {
    /// A record of the wrong shape was handed to an operation, or a record
    /// was in the wrong masking state for it.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A pseudonym or row is absent from its store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create targeted a key that already exists.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A backing store failed (connection, lock, I/O). Not retried here.
    #[error("store failure: {0}")]
    Store(String),

    /// Key material was malformed (wrong length, bad hex).
    #[error("invalid key")]
    InvalidKey,

    /// HKDF expansion of the master key failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Configuration was missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MaskError {
    /// Whether this error means the mapping store and the record store have
    /// fallen out of sync (a referenced pseudonym has no mapping entry).
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<rusqlite::Error> for MaskError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".into()),
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::DuplicateKey(err.to_string())
            }
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for MaskError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Store(format!("blocking store task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_found_is_integrity_violation() {
        assert!(MaskError::NotFound("abc".into()).is_integrity_violation());
        assert!(!MaskError::DuplicateKey("abc".into()).is_integrity_violation());
        assert!(!MaskError::Store("down".into()).is_integrity_violation());
    }

    #[test]
    fn test_display_names_the_key() {
        let err = MaskError::NotFound("pseudonym 3fa1".into());
        assert_eq!(err.to_string(), "not found: pseudonym 3fa1");
    }
}
