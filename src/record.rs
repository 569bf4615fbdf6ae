//! The maskable record capability.
//!
//! Any entity that is persisted through the masking layer implements
//! [`MaskableRecord`]: it publishes a static schema saying which of its
//! fields are sensitive, and gives indexed access to their current values.
//!
//! Every field is optional. `None` means "not specified": on create the
//! column is left empty, on update the persisted value is kept.

use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};

/// The storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    /// Unix seconds.
    Timestamp,
    Flag,
}

/// Static description of one field of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Whether the value must be pseudonymized before persistence.
    pub masked: bool,
}

impl FieldSpec {
    pub const fn masked_text(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Text, masked: true }
    }

    pub const fn text(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Text, masked: false }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Integer, masked: false }
    }

    pub const fn timestamp(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Timestamp, masked: false }
    }

    pub const fn flag(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Flag, masked: false }
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Timestamp(i64),
    Flag(bool),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Integer(_) => FieldKind::Integer,
            Self::Timestamp(_) => FieldKind::Timestamp,
            Self::Flag(_) => FieldKind::Flag,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Capability implemented by every entity type routed through the masking
/// engine.
pub trait MaskableRecord: Clone + Send + Sync + 'static {
    /// Field layout, in constructor order.
    const SCHEMA: &'static [FieldSpec];

    /// Index of the field that identifies the record in its store.
    const KEY_FIELD: usize;

    /// Current value of field `index`, `None` if unspecified.
    fn field(&self, index: usize) -> Option<FieldValue>;

    /// Replace field `index`. Fails with `InvalidArgument` if the value's
    /// kind does not match the schema or the index is out of range.
    fn set_field(&mut self, index: usize, value: Option<FieldValue>) -> MaskResult<()>;

    fn is_masked(&self) -> bool;

    fn set_masked(&mut self, masked: bool);

    /// Kinds of every field, in order.
    fn parameter_types() -> Vec<FieldKind> {
        Self::SCHEMA.iter().map(|spec| spec.kind).collect()
    }

    /// `(value, should_mask)` for every field, in order.
    fn mask_information(&self) -> Vec<(Option<FieldValue>, bool)> {
        Self::SCHEMA
            .iter()
            .enumerate()
            .map(|(i, spec)| (self.field(i), spec.masked))
            .collect()
    }

    /// Indices of the fields flagged for masking.
    fn masked_field_indices() -> Vec<usize> {
        Self::SCHEMA
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.masked)
            .map(|(i, _)| i)
            .collect()
    }

    /// Text of field `index`, `None` if unspecified.
    fn text_field(&self, index: usize) -> MaskResult<Option<String>> {
        match self.field(index) {
            None => Ok(None),
            Some(FieldValue::Text(s)) => Ok(Some(s)),
            Some(other) => Err(MaskError::InvalidArgument(format!(
                "field {} holds {:?}, expected text",
                field_name::<Self>(index),
                other.kind()
            ))),
        }
    }

    /// The identifying value (plaintext or pseudonym, depending on state).
    fn key(&self) -> Option<String> {
        self.text_field(Self::KEY_FIELD).ok().flatten()
    }

    /// Whether any masked field currently carries a value.
    fn has_sensitive_values(&self) -> bool {
        Self::masked_field_indices()
            .into_iter()
            .any(|i| self.field(i).is_some())
    }

    /// Copy every specified field of `update` onto `self`.
    fn merge_from(&mut self, update: &Self) -> MaskResult<()> {
        for i in 0..Self::SCHEMA.len() {
            if let Some(value) = update.field(i) {
                self.set_field(i, Some(value))?;
            }
        }
        Ok(())
    }

    /// Check the schema is usable by the engine: masked fields are text and
    /// the key field is a text field.
    fn validate_schema() -> MaskResult<()> {
        for spec in Self::SCHEMA {
            if spec.masked && spec.kind != FieldKind::Text {
                return Err(MaskError::InvalidArgument(format!(
                    "masked field {} must be text, found {:?}",
                    spec.name, spec.kind
                )));
            }
        }
        match Self::SCHEMA.get(Self::KEY_FIELD) {
            Some(spec) if spec.kind == FieldKind::Text => Ok(()),
            Some(spec) => Err(MaskError::InvalidArgument(format!(
                "key field {} must be text",
                spec.name
            ))),
            None => Err(MaskError::InvalidArgument(format!(
                "key field index {} out of range",
                Self::KEY_FIELD
            ))),
        }
    }
}

pub(crate) fn field_name<R: MaskableRecord>(index: usize) -> &'static str {
    R::SCHEMA.get(index).map(|spec| spec.name).unwrap_or("<unknown>")
}

/// Unwrap a text value for `spec`, rejecting other kinds.
pub fn expect_text(spec: &FieldSpec, value: Option<FieldValue>) -> MaskResult<Option<String>> {
    match value {
        None => Ok(None),
        Some(FieldValue::Text(s)) => Ok(Some(s)),
        Some(other) => Err(kind_mismatch(spec, &other)),
    }
}

/// Unwrap an integer value for `spec`, rejecting other kinds.
pub fn expect_integer(spec: &FieldSpec, value: Option<FieldValue>) -> MaskResult<Option<i64>> {
    match value {
        None => Ok(None),
        Some(FieldValue::Integer(n)) if spec.kind == FieldKind::Integer => Ok(Some(n)),
        Some(FieldValue::Timestamp(t)) if spec.kind == FieldKind::Timestamp => Ok(Some(t)),
        Some(other) => Err(kind_mismatch(spec, &other)),
    }
}

/// Unwrap a flag value for `spec`, rejecting other kinds.
pub fn expect_flag(spec: &FieldSpec, value: Option<FieldValue>) -> MaskResult<Option<bool>> {
    match value {
        None => Ok(None),
        Some(FieldValue::Flag(b)) => Ok(Some(b)),
        Some(other) => Err(kind_mismatch(spec, &other)),
    }
}

fn kind_mismatch(spec: &FieldSpec, value: &FieldValue) -> MaskError {
    MaskError::InvalidArgument(format!(
        "field {} expects {:?}, got {:?}",
        spec.name,
        spec.kind,
        value.kind()
    ))
}
