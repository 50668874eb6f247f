//! License sessions.
//!
//! A session walks one license exchange:
//!
//! ```text
//! Created -> ChallengeIssued -> Verified -> Closed
//!                 |                 |
//!                 +----> Failed <---+
//! ```
//!
//! Any state may move to `Closed`. Each session owns its nonce (request id
//! and key control nonce), so a response can only complete the session
//! whose challenge it answers. Per-session state sits behind a mutex.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::certificate::ServiceCertificate;
use crate::codec::{self, LicenseRequestParams};
use crate::crypto::{self, DerivationContext};
use crate::device::{Device, DeviceType};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::license_protocol::LicenseType;
use crate::pssh::{ProtectionHeader, Pssh};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    ChallengeIssued,
    Verified,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "CREATED",
            SessionState::ChallengeIssued => "CHALLENGE_ISSUED",
            SessionState::Verified => "VERIFIED",
            SessionState::Failed => "FAILED",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

struct SessionInner {
    state: SessionState,
    context: Option<DerivationContext>,
    keys: Vec<Key>,
}

impl SessionInner {
    fn require(&self, expected: SessionState, name: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidSessionState {
                expected: name,
                actual: self.state,
            })
        }
    }

    fn wipe(&mut self) {
        if let Some(mut context) = self.context.take() {
            context.enc.zeroize();
            context.mac.zeroize();
        }
        self.keys.clear();
    }
}

/// A Widevine CDM session.
pub struct Session {
    number: u32,
    id: Vec<u8>,
    request_id: Vec<u8>,
    device: Arc<Device>,
    pssh: Pssh,
    service_certificate: Option<ServiceCertificate>,
    license_type: LicenseType,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("number", &self.number)
            .field("id", &hex::encode(&self.id))
            .field("license_type", &self.license_type)
            .field("privacy_mode", &self.service_certificate.is_some())
            .field("state", &self.inner.try_lock().map(|inner| inner.state))
            .finish()
    }
}

impl Session {
    /// Open a session for one protection header.
    ///
    /// With a service certificate, the client id is sent encrypted.
    pub fn open(
        number: u32,
        device: Arc<Device>,
        pssh: Pssh,
        service_certificate: Option<ServiceCertificate>,
        license_type: LicenseType,
    ) -> Self {
        let request_id = new_request_id(device.device_type, number);
        Self {
            number,
            id: crypto::random_bytes::<16>().to_vec(),
            request_id,
            device,
            pssh,
            service_certificate,
            license_type,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                context: None,
                keys: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// The nonce a license must echo to be accepted by this session.
    pub fn request_id(&self) -> &[u8] {
        &self.request_id
    }

    pub fn header(&self) -> &ProtectionHeader {
        self.pssh.header()
    }

    pub fn license_type(&self) -> LicenseType {
        self.license_type
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Build the signed license request. Allowed once, from `Created`.
    pub fn build_challenge(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.require(SessionState::Created, "CREATED")?;

        self.device.verify_key_pair()?;

        let request_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let params = LicenseRequestParams {
            client_id: &self.device.client_id,
            service_certificate: self.service_certificate.as_ref(),
            init_data: &self.pssh.init_data,
            license_type: self.license_type,
            request_id: &self.request_id,
            key_control_nonce: self
                .device
                .send_key_control_nonce()
                .then(key_control_nonce),
            request_time,
        };
        let encoded = codec::encode_license_request(&params, &self.device.private_key)?;

        inner.context = Some(crypto::derive_context(&encoded.request));
        inner.state = SessionState::ChallengeIssued;
        debug!(
            "Session {} issued a {} challenge ({} bytes)",
            self.number,
            self.license_type.as_str_name(),
            encoded.signed.len()
        );
        Ok(encoded.signed)
    }

    /// Verify a license response and recover its keys.
    ///
    /// Allowed once, from `ChallengeIssued`. Any failure moves the session
    /// to `Failed`; a failed session cannot be retried.
    pub fn process_response(&self, response: &[u8]) -> Result<Vec<Key>> {
        let mut inner = self.inner.lock();
        inner.require(SessionState::ChallengeIssued, "CHALLENGE_ISSUED")?;

        let result = match inner.context.as_ref() {
            Some(context) => self.recover_keys(context, response),
            None => Err(Error::InvalidSessionState {
                expected: "CHALLENGE_ISSUED",
                actual: inner.state,
            }),
        };

        inner.wipe();
        match result {
            Ok(keys) => {
                inner.keys = keys.clone();
                inner.state = SessionState::Verified;
                info!("Session {} verified license with {} keys", self.number, keys.len());
                Ok(keys)
            }
            Err(e) => {
                inner.state = SessionState::Failed;
                warn!("Session {} failed to process license: {}", self.number, e);
                Err(e)
            }
        }
    }

    fn recover_keys(
        &self,
        context: &DerivationContext,
        response: &[u8],
    ) -> Result<Vec<Key>> {
        let response = codec::decode_license_response(response, &self.request_id)?;
        // Derived keys are zeroized on drop; only content keys are kept.
        let (_derived, keys) =
            crypto::process_license(&self.device.private_key, context, &response)?;
        Ok(keys)
    }

    /// Keys recovered by a verified session.
    pub fn keys(&self) -> Result<Vec<Key>> {
        let inner = self.inner.lock();
        inner.require(SessionState::Verified, "VERIFIED")?;
        Ok(inner.keys.clone())
    }

    /// Wipe all key material. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Closed {
            inner.wipe();
            inner.state = SessionState::Closed;
            trace!("Session {} closed", self.number);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.get_mut().wipe();
    }
}

/// Android devices use a counter-based request id:
/// 4 random bytes, 4 zero bytes, then the session number (u64 LE),
/// hex-encoded in upper case. Other devices use 16 random bytes.
fn new_request_id(device_type: DeviceType, number: u32) -> Vec<u8> {
    match device_type {
        DeviceType::Android => {
            let mut req = [0u8; 16];
            req[..4].copy_from_slice(&crypto::random_bytes::<4>());
            req[8..].copy_from_slice(&u64::from(number).to_le_bytes());
            hex::encode_upper(req).into_bytes()
        }
        DeviceType::Chrome => crypto::random_bytes::<16>().to_vec(),
    }
}

/// A non-zero nonce in `1..2^31`.
fn key_control_nonce() -> u32 {
    (u32::from_le_bytes(crypto::random_bytes()) % 0x7FFF_FFFF) + 1
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::testutil;

    fn session(device: Device) -> Session {
        let pssh = Pssh::from_key_ids(&[Uuid::from_u128(7)]).expect("pssh");
        Session::open(1, Arc::new(device), pssh, None, LicenseType::Streaming)
    }

    #[test]
    fn android_request_id_format() {
        let id = new_request_id(DeviceType::Android, 5);
        assert_eq!(id.len(), 32);
        let text = std::str::from_utf8(&id).expect("ascii");
        assert_eq!(&text[8..16], "00000000");
        assert_eq!(&text[16..], "0500000000000000");
        assert_eq!(text, text.to_uppercase());

        assert_eq!(new_request_id(DeviceType::Chrome, 5).len(), 16);
    }

    #[test]
    fn challenge_is_issued_once() {
        let session = session(testutil::device());
        assert_eq!(session.state(), SessionState::Created);

        let challenge = session.build_challenge().expect("challenge");
        assert!(!challenge.is_empty());
        assert_eq!(session.state(), SessionState::ChallengeIssued);

        let err = session.build_challenge().expect_err("second challenge");
        assert!(matches!(
            err,
            Error::InvalidSessionState {
                actual: SessionState::ChallengeIssued,
                ..
            }
        ));
    }

    #[test]
    fn response_before_challenge_is_rejected() {
        let session = session(testutil::device());
        let err = session.process_response(b"anything").expect_err("no challenge");
        assert!(matches!(
            err,
            Error::InvalidSessionState {
                actual: SessionState::Created,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn bad_response_fails_the_session() {
        let session = session(testutil::device());
        session.build_challenge().expect("challenge");

        assert!(session.process_response(b"\xff\xff").is_err());
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.process_response(b"\xff\xff").expect_err("failed session");
        assert!(matches!(
            err,
            Error::InvalidSessionState {
                actual: SessionState::Failed,
                ..
            }
        ));
    }

    #[test]
    fn mismatched_device_key_blocks_challenge() {
        let key = testutil::private_key();
        let device = Device::new(
            DeviceType::Chrome,
            3,
            0,
            testutil::other_private_key(),
            testutil::client_id_for(&key),
        )
        .expect("device");
        let session = session(device);

        assert!(matches!(
            session.build_challenge(),
            Err(Error::DeviceKeyMismatch)
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn close_is_idempotent() {
        let session = session(testutil::device());
        session.build_challenge().expect("challenge");
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.keys().is_err());
        assert!(session.process_response(b"").is_err());
    }

    #[test]
    fn key_control_nonce_range() {
        for _ in 0..1000 {
            let nonce = key_control_nonce();
            assert!(nonce >= 1 && nonce < 0x8000_0000);
        }
    }
}
