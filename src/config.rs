//! Startup configuration.
//!
//! A [`MaskingConfig`] names where the master key comes from and which
//! mapping store to use. It is read once, validated, and turned into a
//! [`MaskingEngine`] with [`MaskingConfig::build_engine`]. Key problems
//! surface here, never on a per-call basis.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::engine::MaskingEngine;
use crate::error::{MaskError, MaskResult};
use crate::hasher::Hasher;
use crate::keys::MasterKey;
use crate::mapping::{MappingStore, MemoryMappingStore};
use crate::sqlite::SqliteMappingStore;

pub const KEY_ENV: &str = "HEXMASK_KEY";
pub const KEY_FILE_ENV: &str = "HEXMASK_KEY_FILE";
pub const STORE_PATH_ENV: &str = "HEXMASK_STORE_PATH";
pub const PREFIX_ENV: &str = "HEXMASK_PSEUDONYM_PREFIX";
pub const AUDIT_CAPACITY_ENV: &str = "HEXMASK_AUDIT_CAPACITY";

const MAX_PREFIX_LEN: usize = 16;

/// Where the hex-encoded master key is read from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// Inline in the configuration. Intended for tests and local runs.
    Hex { value: String },
    /// An environment variable holding the hex key.
    Env { var: String },
    /// A file (e.g. a mounted secret) holding the hex key.
    File { path: PathBuf },
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hex { .. } => f.debug_struct("Hex").field("value", &"[REDACTED]").finish(),
            Self::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
        }
    }
}

impl KeySource {
    pub fn load(&self) -> MaskResult<MasterKey> {
        match self {
            Self::Hex { value } => MasterKey::from_hex(value),
            Self::Env { var } => {
                let value = env::var(var).map_err(|_| {
                    MaskError::Config(format!("environment variable {var} is not set"))
                })?;
                MasterKey::from_hex(&value)
            }
            Self::File { path } => {
                let value = fs::read_to_string(path).map_err(|e| {
                    warn!(path = %path.display(), error = %e, "failed to read key file");
                    MaskError::Config(format!("cannot read key file {}: {e}", path.display()))
                })?;
                MasterKey::from_hex(&value)
            }
        }
    }
}

/// Which mapping store backs the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskingConfig {
    pub key: KeySource,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pseudonym_prefix: Option<String>,
    /// Audit records kept in memory; defaults to
    /// [`DEFAULT_AUDIT_CAPACITY`].
    #[serde(default)]
    pub audit_capacity: Option<usize>,
}

impl MaskingConfig {
    pub fn new(key: KeySource) -> Self {
        Self {
            key,
            store: StoreConfig::default(),
            pseudonym_prefix: None,
            audit_capacity: None,
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = Some(capacity);
        self
    }

    pub fn with_pseudonym_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pseudonym_prefix = Some(prefix.into());
        self
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> MaskResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "loaded masking config");
        Ok(config)
    }

    /// Load from `HEXMASK_*` environment variables.
    ///
    /// `HEXMASK_KEY` wins over `HEXMASK_KEY_FILE`; `HEXMASK_STORE_PATH`
    /// selects the SQLite store, otherwise the in-memory store is used.
    /// `HEXMASK_AUDIT_CAPACITY` bounds the in-memory audit log.
    pub fn from_env() -> MaskResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`MaskingConfig::from_env`] over an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> MaskResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // The value is carried, not the variable name, so loading the key
        // later reads what this lookup saw.
        let key = if let Some(value) = set(KEY_ENV) {
            KeySource::Hex { value }
        } else if let Some(path) = set(KEY_FILE_ENV) {
            KeySource::File { path: PathBuf::from(path) }
        } else {
            return Err(MaskError::Config(format!(
                "neither {KEY_ENV} nor {KEY_FILE_ENV} is set"
            )));
        };

        let store = match set(STORE_PATH_ENV) {
            Some(path) => StoreConfig::Sqlite { path: PathBuf::from(path) },
            None => {
                info!("{STORE_PATH_ENV} not set, using in-memory mapping store");
                StoreConfig::Memory
            }
        };

        let audit_capacity = set(AUDIT_CAPACITY_ENV)
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|e| {
                    MaskError::Config(format!("invalid {AUDIT_CAPACITY_ENV} value: {e}"))
                })
            })
            .transpose()?;

        let config = Self {
            key,
            store,
            pseudonym_prefix: set(PREFIX_ENV),
            audit_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MaskResult<()> {
        match &self.key {
            KeySource::Env { var } if var.trim().is_empty() => {
                return Err(MaskError::Config("key variable name is empty".into()));
            }
            KeySource::File { path } if path.as_os_str().is_empty() => {
                return Err(MaskError::Config("key file path is empty".into()));
            }
            _ => {}
        }

        if let StoreConfig::Sqlite { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(MaskError::Config("mapping store path is empty".into()));
            }
        }

        if let Some(prefix) = &self.pseudonym_prefix {
            if prefix.len() > MAX_PREFIX_LEN {
                return Err(MaskError::Config(format!(
                    "pseudonym prefix longer than {MAX_PREFIX_LEN} characters"
                )));
            }
            if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(MaskError::Config(
                    "pseudonym prefix may only contain ASCII letters, digits and '_'".into(),
                ));
            }
        }
        Ok(())
    }

    /// Load the key, open the store, and assemble the engine.
    pub fn build_engine(&self) -> MaskResult<MaskingEngine> {
        self.validate()?;
        let master = self.key.load()?;
        let mut hasher = Hasher::new(&master)?;
        if let Some(prefix) = &self.pseudonym_prefix {
            hasher = hasher.with_prefix(prefix.clone());
        }

        let store: Arc<dyn MappingStore> = match &self.store {
            StoreConfig::Memory => Arc::new(MemoryMappingStore::new()),
            StoreConfig::Sqlite { path } => Arc::new(SqliteMappingStore::open(path)?),
        };
        let audit_capacity = self.audit_capacity.unwrap_or(DEFAULT_AUDIT_CAPACITY);
        info!(
            store = ?self.store,
            prefixed = self.pseudonym_prefix.is_some(),
            audit_capacity,
            "masking engine ready"
        );
        Ok(MaskingEngine::new(hasher, store).with_audit_capacity(audit_capacity))
    }
}
