//! Shared fixtures: a test device and an in-process license server.
#![allow(dead_code)]

use std::path::Path;

use prost::Message;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use uuid::Uuid;

use vinecdm::codec;
use vinecdm::crypto;
use vinecdm::device::{self, parse_private_key, Device, DeviceType};
use vinecdm::key::KeyType;
use vinecdm::license_protocol::client_identification::{NameValue, TokenType};
use vinecdm::license_protocol::license::KeyContainer;
use vinecdm::license_protocol::signed_message::MessageType;
use vinecdm::license_protocol::{
    drm_certificate, ClientIdentification, DrmCertificate, License, LicenseIdentification,
    LicenseRequest, LicenseType, SignedDrmCertificate, SignedMessage,
};
use vinecdm::pssh::Pssh;

pub const SYSTEM_ID: u32 = 4464;

/// Public test asset: one key id, content id `fkj3ljaSdfalkr3j`.
pub const TEST_PSSH: &str = "AAAAW3Bzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAADsIARIQ62dqu8s0Xpa7z2FmMPGj2hoNd2lkZXZpbmVfdGVzdCIQZmtqM2xqYVNkZmFsa3IzaioCSEQyAA==";

/// Content keys the server hands out.
pub const GOLDEN_KEYS: [(&str, &str); 2] = [
    ("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb"),
    ("0294b9599d755de2bbf0fdca3fa5eab7", "3bda2f40344c7def614227b9c0f03e26"),
];

pub fn private_key_pem() -> &'static [u8] {
    include_bytes!("../fixtures/device_private_key.pem")
}

pub fn private_key() -> RsaPrivateKey {
    parse_private_key(private_key_pem()).expect("fixture key")
}

pub fn other_private_key() -> RsaPrivateKey {
    parse_private_key(include_bytes!("../fixtures/other_private_key.pem")).expect("fixture key")
}

/// A client id whose certificate carries the public half of `key`.
pub fn client_id_for(key: &RsaPrivateKey) -> ClientIdentification {
    let public_key = RsaPublicKey::from(key).to_pkcs1_der().expect("encode public key");
    let certificate = DrmCertificate {
        r#type: Some(drm_certificate::Type::Device as i32),
        serial_number: Some(vec![0x22; 16]),
        public_key: Some(public_key.as_bytes().to_vec()),
        system_id: Some(SYSTEM_ID),
        ..Default::default()
    };
    let signed = SignedDrmCertificate {
        drm_certificate: Some(certificate.encode_to_vec()),
        signature: Some(vec![0u8; 256]),
        signer: None,
    };
    ClientIdentification {
        r#type: Some(TokenType::DrmDeviceCertificate as i32),
        token: Some(signed.encode_to_vec()),
        client_info: vec![NameValue {
            name: Some("company_name".to_string()),
            value: Some("vinecdm".to_string()),
        }],
        ..Default::default()
    }
}

pub fn device_of_type(device_type: DeviceType) -> Device {
    let key = private_key();
    let client_id = client_id_for(&key);
    Device::new(device_type, 3, device_type.default_flags(), key, client_id)
        .expect("fixture device")
}

pub fn device() -> Device {
    device_of_type(DeviceType::Android)
}

/// Write a device directory (`wv.json` plus separate credential files).
pub fn write_device_dir(dir: &Path) {
    std::fs::write(
        dir.join(device::CONFIG_FILE_NAME),
        r#"{"session_id_type": "android", "security_level": 3}"#,
    )
    .expect("write config");
    std::fs::write(dir.join(device::PRIVATE_KEY_FILE_NAME), private_key_pem()).expect("write key");
    std::fs::write(
        dir.join(device::CLIENT_ID_FILE_NAME),
        client_id_for(&private_key()).encode_to_vec(),
    )
    .expect("write client id");
}

pub fn test_pssh() -> Pssh {
    Pssh::from_base64(TEST_PSSH).expect("test pssh")
}

/// A PSSH asking for every golden key by id.
pub fn golden_pssh() -> Pssh {
    Pssh::from_key_ids(&golden_kids()).expect("golden pssh")
}

pub fn golden_kids() -> Vec<Uuid> {
    GOLDEN_KEYS
        .iter()
        .map(|(kid, _)| Uuid::try_parse(kid).expect("kid"))
        .collect()
}

/// In-process license server.
///
/// Verifies the challenge against the device key, wraps a fresh session
/// key, and returns the golden keys under the derived encryption key.
pub struct LicenseServer {
    device_key: RsaPublicKey,
    wrap_key: RsaPublicKey,
    pub core_message: Option<Vec<u8>>,
}

/// What the server saw in a challenge.
pub struct ReceivedRequest {
    pub request: LicenseRequest,
    pub request_id: Vec<u8>,
}

impl LicenseServer {
    pub fn new(device: &Device) -> Self {
        Self {
            device_key: device.public_key(),
            wrap_key: device.public_key(),
            core_message: None,
        }
    }

    /// Wrap session keys for a different key pair than the one that signed.
    pub fn wrapping_for(mut self, key: RsaPublicKey) -> Self {
        self.wrap_key = key;
        self
    }

    pub fn with_core_message(mut self, core_message: &[u8]) -> Self {
        self.core_message = Some(core_message.to_vec());
        self
    }

    pub fn receive(&self, challenge: &[u8]) -> ReceivedRequest {
        let (signed, request) = codec::decode_license_request(challenge).expect("decode challenge");
        let msg = signed.msg.as_deref().expect("challenge body");
        let signature = signed.signature.as_deref().expect("challenge signature");
        assert!(
            crypto::verify_pss_sha1(&self.device_key, msg, signature),
            "challenge signature does not verify"
        );
        let request_id = codec::request_id(&request).expect("request id").to_vec();
        ReceivedRequest {
            request,
            request_id,
        }
    }

    pub fn respond(&self, challenge: &[u8]) -> Vec<u8> {
        self.respond_message(challenge, |_| {}).encode_to_vec()
    }

    pub fn respond_with(&self, challenge: &[u8], edit: impl FnOnce(&mut License)) -> Vec<u8> {
        self.respond_message(challenge, edit).encode_to_vec()
    }

    /// The signed response, before serialization.
    pub fn respond_message(
        &self,
        challenge: &[u8],
        edit: impl FnOnce(&mut License),
    ) -> SignedMessage {
        let received = self.receive(challenge);
        let (signed, _) = codec::decode_license_request(challenge).expect("decode challenge");
        let request_bytes = signed.msg.expect("challenge body");

        let session_key = crypto::random_bytes::<16>();
        let wrapped = crypto::rsa_oaep_encrypt(&self.wrap_key, &session_key).expect("wrap");
        let context = crypto::derive_context(&request_bytes);
        let derived = crypto::derive_keys(&context, &session_key).expect("derive");

        let mut key = GOLDEN_KEYS
            .iter()
            .map(|(kid, key)| {
                let iv = crypto::random_bytes::<16>();
                let key = hex::decode(key).expect("key hex");
                KeyContainer {
                    id: Some(hex::decode(kid).expect("kid hex")),
                    iv: Some(iv.to_vec()),
                    key: Some(crypto::aes_cbc_encrypt(&derived.enc_key, &iv, &key).expect("encrypt")),
                    r#type: Some(KeyType::Content as i32),
                    ..Default::default()
                }
            })
            .collect::<Vec<_>>();
        let signing_iv = crypto::random_bytes::<16>();
        key.push(KeyContainer {
            iv: Some(signing_iv.to_vec()),
            key: Some(
                crypto::aes_cbc_encrypt(&derived.enc_key, &signing_iv, &[0x42; 64]).expect("encrypt"),
            ),
            r#type: Some(KeyType::Signing as i32),
            ..Default::default()
        });

        let mut license = License {
            id: Some(LicenseIdentification {
                request_id: Some(received.request_id),
                session_id: Some(b"server-session".to_vec()),
                r#type: Some(LicenseType::Streaming as i32),
                version: Some(0),
                ..Default::default()
            }),
            key,
            ..Default::default()
        };
        edit(&mut license);

        let msg = license.encode_to_vec();
        let signature = crypto::sign_license(&derived.mac_key_server, self.core_message.as_deref(), &msg)
            .expect("sign");

        SignedMessage {
            r#type: Some(MessageType::License as i32),
            msg: Some(msg),
            signature: Some(signature),
            session_key: Some(wrapped),
            oemcrypto_core_message: self.core_message.clone(),
            ..Default::default()
        }
    }
}

pub fn golden_key_hex(kid: &Uuid) -> Option<&'static str> {
    let simple = kid.simple().to_string();
    GOLDEN_KEYS
        .iter()
        .find(|(k, _)| *k == simple)
        .map(|(_, key)| *key)
}
