//! Key material and derivation.
//!
//! This module owns two responsibilities:
//! 1. Holding the master key in a type that is opaque, non-cloneable, and
//!    zeroised on drop.
//! 2. Deriving the HMAC key used for pseudonyms from the master key with
//!    HKDF-SHA256.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `hasher`).
//!
//! ## Derivation structure
//!
//! ```text
//! HKDF-SHA256(
//!     ikm  = master_key,
//!     salt = None,
//!     info = "hexmask:{purpose}:v1"
//! )
//! ```

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{MaskError, MaskResult};

/// Size of the master key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// HKDF purpose tag for the pseudonym HMAC key.
pub(crate) const PSEUDONYM_PURPOSE: &str = "pseudonym";

/// The single secret from which the pseudonym key is derived.
///
/// - Not `Clone`.
/// - Zeroised on drop.
/// - `Debug` never prints the bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a hex-encoded 32-byte key, as stored in configuration.
    pub fn from_hex(encoded: &str) -> MaskResult<Self> {
        let mut decoded = hex::decode(encoded.trim()).map_err(|_| MaskError::InvalidKey)?;
        let result = <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self::from_bytes)
            .map_err(|_| MaskError::InvalidKey);
        decoded.zeroize();
        result
    }

    /// Generate a fresh key from the system RNG.
    pub fn generate() -> MaskResult<Self> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes).map_err(|_| MaskError::RandomnessFailure)?;
        Ok(Self::from_bytes(bytes))
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Derive the HMAC-SHA256 key for a given purpose.
///
/// Different purposes produce statistically independent keys, and the
/// derived key reveals nothing about the master key.
pub(crate) fn derive_hmac_key(master: &MasterKey, purpose: &str) -> MaskResult<hmac::Key> {
    let info = format!("hexmask:{}:v1", purpose);

    // An empty salt is treated by HKDF as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(master.as_bytes());

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hmac::HMAC_SHA256)
        .map_err(|_| MaskError::KeyDerivationFailure)?;

    Ok(hmac::Key::from(okm))
}
