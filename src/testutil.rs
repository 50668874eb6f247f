//! Fixture devices for unit tests.

use prost::Message;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::device::{parse_private_key, Device, DeviceType};
use crate::license_protocol::client_identification::TokenType;
use crate::license_protocol::{
    drm_certificate, ClientIdentification, DrmCertificate, SignedDrmCertificate,
};

pub(crate) const SYSTEM_ID: u32 = 4464;

pub(crate) fn private_key() -> RsaPrivateKey {
    parse_private_key(include_bytes!("../tests/fixtures/device_private_key.pem"))
        .expect("fixture key")
}

pub(crate) fn other_private_key() -> RsaPrivateKey {
    parse_private_key(include_bytes!("../tests/fixtures/other_private_key.pem"))
        .expect("fixture key")
}

/// A client id whose certificate carries the public half of `key`.
pub(crate) fn client_id_for(key: &RsaPrivateKey) -> ClientIdentification {
    let public_key = RsaPublicKey::from(key)
        .to_pkcs1_der()
        .expect("encode public key");
    let certificate = DrmCertificate {
        r#type: Some(drm_certificate::Type::Device as i32),
        serial_number: Some(vec![0x11; 16]),
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
        ..Default::default()
    }
}

pub(crate) fn device_of_type(device_type: DeviceType) -> Device {
    let key = private_key();
    let client_id = client_id_for(&key);
    Device::new(device_type, 3, device_type.default_flags(), key, client_id)
        .expect("fixture device")
}

pub(crate) fn device() -> Device {
    device_of_type(DeviceType::Android)
}
