//! Deterministic keyed pseudonyms.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). Every pseudonym in the system is produced
//! by [`Hasher::hash`].
//!
//! Primitive choices:
//! - **MAC**: HMAC-SHA256, keyed by an HKDF-derived key (never the raw master key)
//! - **Encoding**: lowercase hex, 64 characters
//! - **Salt**: none. Equal plaintexts must map to equal pseudonyms so that
//!   records can be looked up by exact match and mapping entries shared.

use std::fmt;

use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::MaskResult;
use crate::keys::{self, MasterKey};

/// Length of the hex-encoded HMAC-SHA256 tag.
pub const PSEUDONYM_HEX_LEN: usize = 64;

/// A deterministic one-way substitute for a plaintext value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

impl Pseudonym {
    /// Wrap a value already known to be a pseudonym (e.g. read back from the
    /// record store).
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// A short prefix that is safe to put in log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Pseudonym {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Keyed plaintext -> pseudonym transform.
///
/// Cheap to clone; holds only the derived HMAC key and an optional prefix.
#[derive(Clone)]
pub struct Hasher {
    key: hmac::Key,
    prefix: Option<String>,
}

impl Hasher {
    /// Build a hasher from the master key. Fails only if key derivation
    /// fails, which is a startup error.
    pub fn new(master: &MasterKey) -> MaskResult<Self> {
        let key = keys::derive_hmac_key(master, keys::PSEUDONYM_PURPOSE)?;
        Ok(Self { key, prefix: None })
    }

    /// Prepend `prefix` to every pseudonym this hasher produces.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    /// Compute the pseudonym of `plaintext`. Pure and deterministic.
    pub fn hash(&self, plaintext: &str) -> Pseudonym {
        let tag = hmac::sign(&self.key, plaintext.as_bytes());
        let encoded = hex::encode(tag.as_ref());
        match &self.prefix {
            Some(prefix) => Pseudonym(format!("{prefix}{encoded}")),
            None => Pseudonym(encoded),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("key", &"[REDACTED]")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(seed: u8) -> Hasher {
        Hasher::new(&MasterKey::from_bytes([seed; 32])).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let h = hasher(1);
        assert_eq!(h.hash("555-0100"), h.hash("555-0100"));
        // A second hasher from the same key agrees, as another process would.
        assert_eq!(h.hash("555-0100"), hasher(1).hash("555-0100"));
    }

    #[test]
    fn test_distinct_inputs_and_keys() {
        let h = hasher(1);
        assert_ne!(h.hash("a@x.com"), h.hash("b@x.com"));
        assert_ne!(h.hash("a@x.com"), hasher(2).hash("a@x.com"));
    }

    #[test]
    fn test_fixed_length_hex() {
        let h = hasher(1);
        for input in ["", "x", "a much longer plaintext value than usual"] {
            let p = h.hash(input);
            assert_eq!(p.as_str().len(), PSEUDONYM_HEX_LEN);
            assert!(p.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_prefix() {
        let h = hasher(1).with_prefix("pii_");
        let p = h.hash("10.0.0.1");
        assert!(p.as_str().starts_with("pii_"));
        assert_eq!(p.as_str().len(), 4 + PSEUDONYM_HEX_LEN);
        assert_eq!(&p.as_str()[4..], hasher(1).hash("10.0.0.1").as_str());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", hasher(9));
        assert!(debug.contains("[REDACTED]"));
    }
}
