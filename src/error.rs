//! Error types for vinecdm.
//!
//! Variants are grouped so that callers can tell a broken device apart from
//! a bad or incompatible server response. No variant carries key material.

use thiserror::Error;

use crate::session::SessionState;

/// Main error type for vinecdm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device credentials could not be loaded. The device is unusable.
    #[error("Invalid device format: {0}")]
    InvalidDeviceFormat(#[from] DeviceFormatError),

    /// The device private key does not belong to the certificate in its client id.
    #[error("Device private key does not match its client id certificate")]
    DeviceKeyMismatch,

    /// The protection header (PSSH) could not be parsed.
    #[error("Malformed protection header: {0}")]
    MalformedProtectionHeader(String),

    /// The service certificate is malformed or not signed by the root.
    #[error("Invalid service certificate: {0}")]
    InvalidServiceCertificate(String),

    /// The license type is not one of STREAMING, OFFLINE or AUTOMATIC.
    #[error("Invalid license type: {0}")]
    InvalidLicenseType(String),

    /// The license response could not be decoded.
    #[error("Invalid license message: {0}")]
    InvalidLicenseMessage(String),

    /// The license does not echo the nonce of the request it answers.
    #[error("License response is not bound to this request: {0}")]
    ResponseBindingMismatch(String),

    /// The session key could not be unwrapped with the device private key.
    #[error("Failed to decrypt the license session key with the device key")]
    SessionKeyDecryption,

    /// The license signature did not verify under the derived MAC key.
    #[error("License signature verification failed")]
    SignatureVerificationFailed,

    /// An operation was called in a state that does not allow it.
    #[error("Invalid session state: expected {expected}, session is {actual}")]
    InvalidSessionState {
        expected: &'static str,
        actual: SessionState,
    },

    /// No session is open with the specified identifier.
    #[error("Session identifier {} is invalid", hex::encode(.0))]
    InvalidSession(Vec<u8>),

    /// Too many sessions are open.
    #[error("Too many sessions open (max {max})")]
    TooManySessions { max: usize },

    /// A symmetric or asymmetric primitive rejected its input.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a device credential could not be loaded.
#[derive(Debug, Error)]
pub enum DeviceFormatError {
    #[error("invalid WVD magic bytes")]
    BadMagic,
    #[error("WVD data is truncated: {0}")]
    Truncated(&'static str),
    #[error("unsupported WVD version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid device type {0}")]
    BadDeviceType(String),
    #[error("invalid security level {0}")]
    BadSecurityLevel(u8),
    #[error("WVD field too large to serialize ({0} bytes, max 65535)")]
    FieldTooLarge(usize),
    #[error("required device file {0} is missing")]
    MissingFile(&'static str),
    #[error("invalid device config: {0}")]
    Config(String),
    #[error("invalid private key: {0}")]
    PrivateKey(String),
    #[error("invalid client id: {0}")]
    ClientId(String),
    #[error("invalid VMP blob: {0}")]
    Vmp(String),
    #[error("failed to read device: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for vinecdm operations.
pub type Result<T> = std::result::Result<T, Error>;
