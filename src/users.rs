//! Concrete record types for the account subsystem.
//!
//! `UserRecord` is keyed by username, `IpAddressRecord` by address. Both are
//! built with the username/address only and filled in with the `with_*`
//! setters; anything left unset stays `None` and is not touched on update.

use serde::{Deserialize, Serialize};

use crate::error::{MaskError, MaskResult};
use crate::record::{expect_flag, expect_integer, expect_text, FieldSpec, FieldValue, MaskableRecord};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A row of the user table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    /// Password digest.
    pub password: Option<String>,
    pub disabled: Option<bool>,
    pub user_type: Option<String>,
    pub salt: Option<String>,
    pub temp_timestamp: Option<i64>,
    pub email_code: Option<String>,
    pub email_code_timestamp: Option<i64>,
    pub login_failures: Option<i64>,
    pub last_login_fail_timestamp: Option<i64>,
    pub email_code_failures: Option<i64>,
    pub phone_code_failures: Option<i64>,
    #[serde(default)]
    masked: bool,
}

impl UserRecord {
    pub const USERNAME: usize = 0;
    pub const NAME: usize = 1;
    pub const EMAIL: usize = 2;
    pub const PHONE_NUMBER: usize = 3;

    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    pub fn with_password(mut self, digest: impl Into<String>, salt: impl Into<String>) -> Self {
        self.password = Some(digest.into());
        self.salt = Some(salt.into());
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }

    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    pub fn with_temp_timestamp(mut self, ts: i64) -> Self {
        self.temp_timestamp = Some(ts);
        self
    }

    pub fn with_email_code(mut self, code: impl Into<String>, sent_at: i64) -> Self {
        self.email_code = Some(code.into());
        self.email_code_timestamp = Some(sent_at);
        self
    }

    pub fn with_login_failures(mut self, failures: i64, last_failed_at: i64) -> Self {
        self.login_failures = Some(failures);
        self.last_login_fail_timestamp = Some(last_failed_at);
        self
    }

    pub fn with_email_code_failures(mut self, failures: i64) -> Self {
        self.email_code_failures = Some(failures);
        self
    }

    pub fn with_phone_code_failures(mut self, failures: i64) -> Self {
        self.phone_code_failures = Some(failures);
        self
    }
}

impl MaskableRecord for UserRecord {
    const SCHEMA: &'static [FieldSpec] = &[
        FieldSpec::masked_text("username"),
        FieldSpec::masked_text("name"),
        FieldSpec::masked_text("email"),
        FieldSpec::masked_text("phone_number"),
        FieldSpec::text("password"),
        FieldSpec::flag("disabled"),
        FieldSpec::text("user_type"),
        FieldSpec::text("salt"),
        FieldSpec::timestamp("temp_timestamp"),
        FieldSpec::text("email_code"),
        FieldSpec::timestamp("email_code_timestamp"),
        FieldSpec::integer("login_failures"),
        FieldSpec::timestamp("last_login_fail_timestamp"),
        FieldSpec::integer("email_code_failures"),
        FieldSpec::integer("phone_code_failures"),
    ];

    const KEY_FIELD: usize = Self::USERNAME;

    fn field(&self, index: usize) -> Option<FieldValue> {
        match index {
            0 => self.username.clone().map(FieldValue::Text),
            1 => self.name.clone().map(FieldValue::Text),
            2 => self.email.clone().map(FieldValue::Text),
            3 => self.phone_number.clone().map(FieldValue::Text),
            4 => self.password.clone().map(FieldValue::Text),
            5 => self.disabled.map(FieldValue::Flag),
            6 => self.user_type.clone().map(FieldValue::Text),
            7 => self.salt.clone().map(FieldValue::Text),
            8 => self.temp_timestamp.map(FieldValue::Timestamp),
            9 => self.email_code.clone().map(FieldValue::Text),
            10 => self.email_code_timestamp.map(FieldValue::Timestamp),
            11 => self.login_failures.map(FieldValue::Integer),
            12 => self.last_login_fail_timestamp.map(FieldValue::Timestamp),
            13 => self.email_code_failures.map(FieldValue::Integer),
            14 => self.phone_code_failures.map(FieldValue::Integer),
            _ => None,
        }
    }

    fn set_field(&mut self, index: usize, value: Option<FieldValue>) -> MaskResult<()> {
        let spec = Self::SCHEMA
            .get(index)
            .ok_or_else(|| MaskError::InvalidArgument(format!("user field {index} out of range")))?;
        match index {
            0 => self.username = expect_text(spec, value)?,
            1 => self.name = expect_text(spec, value)?,
            2 => self.email = expect_text(spec, value)?,
            3 => self.phone_number = expect_text(spec, value)?,
            4 => self.password = expect_text(spec, value)?,
            5 => self.disabled = expect_flag(spec, value)?,
            6 => self.user_type = expect_text(spec, value)?,
            7 => self.salt = expect_text(spec, value)?,
            8 => self.temp_timestamp = expect_integer(spec, value)?,
            9 => self.email_code = expect_text(spec, value)?,
            10 => self.email_code_timestamp = expect_integer(spec, value)?,
            11 => self.login_failures = expect_integer(spec, value)?,
            12 => self.last_login_fail_timestamp = expect_integer(spec, value)?,
            13 => self.email_code_failures = expect_integer(spec, value)?,
            _ => self.phone_code_failures = expect_integer(spec, value)?,
        }
        Ok(())
    }

    fn is_masked(&self) -> bool {
        self.masked
    }

    fn set_masked(&mut self, masked: bool) {
        self.masked = masked;
    }
}

// ---------------------------------------------------------------------------
// IP address
// ---------------------------------------------------------------------------

/// A row of the IP address table, tracking anonymous registration attempts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpAddressRecord {
    pub ip: Option<String>,
    pub timestamp_locked: Option<i64>,
    pub registration_failures: Option<i64>,
    pub last_reg_fail_timestamp: Option<i64>,
    #[serde(default)]
    masked: bool,
}

impl IpAddressRecord {
    pub const IP: usize = 0;

    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn with_timestamp_locked(mut self, ts: i64) -> Self {
        self.timestamp_locked = Some(ts);
        self
    }

    pub fn with_registration_failures(mut self, failures: i64, last_failed_at: i64) -> Self {
        self.registration_failures = Some(failures);
        self.last_reg_fail_timestamp = Some(last_failed_at);
        self
    }
}

impl MaskableRecord for IpAddressRecord {
    const SCHEMA: &'static [FieldSpec] = &[
        FieldSpec::masked_text("ip"),
        FieldSpec::timestamp("timestamp_locked"),
        FieldSpec::integer("registration_failures"),
        FieldSpec::timestamp("last_reg_fail_timestamp"),
    ];

    const KEY_FIELD: usize = Self::IP;

    fn field(&self, index: usize) -> Option<FieldValue> {
        match index {
            0 => self.ip.clone().map(FieldValue::Text),
            1 => self.timestamp_locked.map(FieldValue::Timestamp),
            2 => self.registration_failures.map(FieldValue::Integer),
            3 => self.last_reg_fail_timestamp.map(FieldValue::Timestamp),
            _ => None,
        }
    }

    fn set_field(&mut self, index: usize, value: Option<FieldValue>) -> MaskResult<()> {
        let spec = Self::SCHEMA
            .get(index)
            .ok_or_else(|| MaskError::InvalidArgument(format!("ip field {index} out of range")))?;
        match index {
            0 => self.ip = expect_text(spec, value)?,
            1 => self.timestamp_locked = expect_integer(spec, value)?,
            2 => self.registration_failures = expect_integer(spec, value)?,
            _ => self.last_reg_fail_timestamp = expect_integer(spec, value)?,
        }
        Ok(())
    }

    fn is_masked(&self) -> bool {
        self.masked
    }

    fn set_masked(&mut self, masked: bool) {
        self.masked = masked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldKind;

    #[test]
    fn test_schemas_are_valid() {
        UserRecord::validate_schema().unwrap();
        IpAddressRecord::validate_schema().unwrap();
        assert_eq!(UserRecord::masked_field_indices(), vec![0, 1, 2, 3]);
        assert_eq!(IpAddressRecord::masked_field_indices(), vec![0]);
    }

    #[test]
    fn test_parameter_types_follow_schema() {
        let kinds = IpAddressRecord::parameter_types();
        assert_eq!(
            kinds,
            vec![FieldKind::Text, FieldKind::Timestamp, FieldKind::Integer, FieldKind::Timestamp]
        );
        assert_eq!(UserRecord::parameter_types().len(), 15);
    }

    #[test]
    fn test_field_accessors_roundtrip() {
        let mut user = UserRecord::new("alice").with_email("a@x.com").with_disabled(true);
        assert_eq!(user.field(UserRecord::EMAIL), Some(FieldValue::Text("a@x.com".into())));
        assert_eq!(user.field(5), Some(FieldValue::Flag(true)));
        assert_eq!(user.field(UserRecord::PHONE_NUMBER), None);

        user.set_field(UserRecord::PHONE_NUMBER, Some(FieldValue::Text("555-0100".into())))
            .unwrap();
        assert_eq!(user.phone_number.as_deref(), Some("555-0100"));

        let err = user.set_field(5, Some(FieldValue::Integer(1))).unwrap_err();
        assert!(matches!(err, MaskError::InvalidArgument(_)));
        assert!(user.set_field(99, None).is_err());
    }

    #[test]
    fn test_mask_information_flags() {
        let ip = IpAddressRecord::new("10.0.0.1").with_timestamp_locked(100);
        let info = ip.mask_information();
        assert_eq!(info[0], (Some(FieldValue::Text("10.0.0.1".into())), true));
        assert_eq!(info[1], (Some(FieldValue::Timestamp(100)), false));
        assert_eq!(info[2], (None, false));
    }

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let mut stored = UserRecord::new("alice").with_name("Alice").with_email("a@x.com");
        let update = UserRecord::new("alice").with_email("b@x.com");
        stored.merge_from(&update).unwrap();
        assert_eq!(stored.name.as_deref(), Some("Alice"));
        assert_eq!(stored.email.as_deref(), Some("b@x.com"));
    }
}
