//! Decrypted keys and their usage restrictions.
//!
//! Keys are unwrapped from license key containers. Key bytes are zeroized
//! on drop and never printed by `Debug`.

use std::fmt;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Error, Result};
pub use crate::license_protocol::license::key_container::KeyType;
use crate::license_protocol::license::key_container::OutputProtection;
use crate::license_protocol::license::KeyContainer;
use crate::pssh;

/// Output restrictions attached to a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputRestrictions {
    pub disable_analog_output: bool,
    pub disable_digital_output: bool,
    pub hdcp: Option<i32>,
    pub cgms_flags: Option<i32>,
}

impl From<&OutputProtection> for OutputRestrictions {
    fn from(protection: &OutputProtection) -> Self {
        Self {
            disable_analog_output: protection.disable_analog_output.unwrap_or(false),
            disable_digital_output: protection.disable_digital_output.unwrap_or(false),
            hdcp: protection.hdcp,
            cgms_flags: protection.cgms_flags,
        }
    }
}

/// A decrypted key.
#[derive(Clone)]
pub struct Key {
    pub key_type: KeyType,
    pub kid: Uuid,
    pub key: Zeroizing<Vec<u8>>,
    /// Permissions for OPERATOR_SESSION keys.
    pub permissions: Vec<String>,
    pub output: OutputRestrictions,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_type", &self.key_type)
            .field("kid", &self.kid)
            .field("key", &"<redacted>")
            .field("permissions", &self.permissions)
            .field("output", &self.output)
            .finish()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type
            && self.kid == other.kid
            && *self.key == *other.key
            && self.permissions == other.permissions
            && self.output == other.output
    }
}

impl Key {
    pub fn new(key_type: KeyType, kid: Uuid, key: Vec<u8>) -> Self {
        Self {
            key_type,
            kid,
            key: Zeroizing::new(key),
            permissions: Vec::new(),
            output: OutputRestrictions::default(),
        }
    }

    /// Unwrap a key container with the derived encryption key.
    ///
    /// For OPERATOR_SESSION keys, permissions are extracted from the
    /// operator_session_key_permissions field.
    pub fn from_key_container(container: &KeyContainer, enc_key: &[u8]) -> Result<Self> {
        let key_type = container
            .r#type
            .and_then(|v| KeyType::try_from(v).ok())
            .ok_or_else(|| Error::InvalidLicenseMessage("Missing key type".to_string()))?;

        let mut permissions = Vec::new();
        if key_type == KeyType::OperatorSession {
            if let Some(perms) = container.operator_session_key_permissions.as_ref() {
                for (allowed, name) in [
                    (perms.allow_encrypt, "allow_encrypt"),
                    (perms.allow_decrypt, "allow_decrypt"),
                    (perms.allow_sign, "allow_sign"),
                    (perms.allow_signature_verify, "allow_signature_verify"),
                ] {
                    if allowed.unwrap_or(false) {
                        permissions.push(name.to_string());
                    }
                }
            }
        }

        let kid = Self::kid_to_uuid(container.id.as_deref().unwrap_or_default())?;

        let key_bytes = container
            .key
            .as_deref()
            .ok_or_else(|| Error::InvalidLicenseMessage("Missing key bytes".to_string()))?;
        let iv = container
            .iv
            .as_deref()
            .ok_or_else(|| Error::InvalidLicenseMessage("Missing IV bytes".to_string()))?;

        Ok(Self {
            key_type,
            kid,
            key: crypto::decrypt_key(enc_key, iv, key_bytes)?,
            permissions,
            output: container
                .required_protection
                .as_ref()
                .map(OutputRestrictions::from)
                .unwrap_or_default(),
        })
    }

    /// Whether the key may be used with unrestricted output.
    pub fn exportable(&self) -> bool {
        !(self.output.disable_analog_output || self.output.disable_digital_output)
    }

    pub fn key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key.as_slice()))
    }

    /// Convert a key container id to a UUID.
    ///
    /// An empty id (signing keys carry none) is the nil UUID. Otherwise the
    /// id is read the way protection headers list key ids: 16 raw bytes, or
    /// 32 hex characters. Any other length is rejected.
    pub fn kid_to_uuid(kid: &[u8]) -> Result<Uuid> {
        if kid.is_empty() {
            return Ok(Uuid::nil());
        }
        pssh::parse_key_id(kid).map_err(|_| {
            Error::InvalidLicenseMessage(format!(
                "Key container id must be 16 bytes or 32 hex characters, got {} bytes",
                kid.len()
            ))
        })
    }
}

/// How a set of content keys compares to the key ids a header asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCoverage {
    /// Requested but not delivered.
    pub missing: Vec<Uuid>,
    /// Delivered but not requested.
    pub extra: Vec<Uuid>,
}

impl KeyCoverage {
    /// Only CONTENT keys count.
    pub fn of(requested: &[Uuid], keys: &[Key]) -> Self {
        let delivered = keys
            .iter()
            .filter(|k| k.key_type == KeyType::Content)
            .map(|k| k.kid)
            .collect::<Vec<_>>();
        Self {
            missing: requested
                .iter()
                .filter(|kid| !delivered.contains(kid))
                .copied()
                .collect(),
            extra: delivered
                .iter()
                .filter(|kid| !requested.contains(kid))
                .copied()
                .collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
