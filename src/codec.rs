//! License protocol codec.
//!
//! Builds signed license requests and decodes license responses and service
//! certificates. Decoding checks structure and nonce binding only; the
//! cryptographic checks live in [`crate::crypto`].

use prost::Message;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::certificate::ServiceCertificate;
use crate::crypto;
use crate::error::{Error, Result};
use crate::license_protocol::license::KeyContainer;
use crate::license_protocol::license_request::content_identification::{
    ContentIdVariant, WidevinePsshData as WidevinePsshDataRequest,
};
use crate::license_protocol::license_request::{ContentIdentification, RequestType};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{
    ClientIdentification, EncryptedClientIdentification, License, LicenseRequest, LicenseType,
    ProtocolVersion, SignedDrmCertificate, SignedMessage,
};

/// Service certificate challenge payload.
pub const SERVICE_CERTIFICATE_CHALLENGE: &[u8] = b"\x08\x04";

/// Parse a license type name, case-insensitively.
pub fn parse_license_type(value: &str) -> Result<LicenseType> {
    LicenseType::from_str_name(&value.to_ascii_uppercase())
        .ok_or_else(|| Error::InvalidLicenseType(value.to_string()))
}

/// Inputs of one license request.
#[derive(Debug, Clone)]
pub struct LicenseRequestParams<'a> {
    pub client_id: &'a ClientIdentification,
    /// When set, the client id is sent encrypted to this certificate.
    pub service_certificate: Option<&'a ServiceCertificate>,
    /// Raw Widevine PSSH data, forwarded to the server as-is.
    pub init_data: &'a [u8],
    pub license_type: LicenseType,
    pub request_id: &'a [u8],
    pub key_control_nonce: Option<u32>,
    pub request_time: i64,
}

/// A signed license request ready to be sent.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    /// Serialized `SignedMessage`, the challenge payload.
    pub signed: Vec<u8>,
    /// Serialized `LicenseRequest`, the key derivation input.
    pub request: Vec<u8>,
}

/// Serialize and sign a license request.
pub fn encode_license_request(
    params: &LicenseRequestParams<'_>,
    private_key: &RsaPrivateKey,
) -> Result<EncodedRequest> {
    let (client_id, encrypted_client_id) = match params.service_certificate {
        Some(cert) => (
            None,
            Some(encrypt_client_id(params.client_id, cert)?),
        ),
        None => (Some(params.client_id.clone()), None),
    };

    let content_id = ContentIdentification {
        content_id_variant: Some(ContentIdVariant::WidevinePsshData(WidevinePsshDataRequest {
            pssh_data: vec![params.init_data.to_vec()],
            license_type: Some(params.license_type as i32),
            request_id: Some(params.request_id.to_vec()),
        })),
    };

    let license_request = LicenseRequest {
        client_id,
        content_id: Some(content_id),
        r#type: Some(RequestType::New as i32),
        request_time: Some(params.request_time),
        key_control_nonce_deprecated: None,
        protocol_version: Some(ProtocolVersion::Version21 as i32),
        key_control_nonce: params.key_control_nonce,
        encrypted_client_id,
    };

    let request = license_request.encode_to_vec();
    let signature = crypto::sign_request(private_key, &request)?;

    let signed = SignedMessage {
        r#type: Some(MessageType::LicenseRequest as i32),
        msg: Some(request.clone()),
        signature: Some(signature),
        ..Default::default()
    }
    .encode_to_vec();

    Ok(EncodedRequest { signed, request })
}

/// Decode a signed license request, as a license server would.
pub fn decode_license_request(data: &[u8]) -> Result<(SignedMessage, LicenseRequest)> {
    let signed = SignedMessage::decode(data).map_err(|e| {
        Error::InvalidLicenseMessage(format!("Failed to parse SignedMessage: {}", e))
    })?;
    if signed.r#type != Some(MessageType::LicenseRequest as i32) {
        return Err(Error::InvalidLicenseMessage(
            "Expected LICENSE_REQUEST message".to_string(),
        ));
    }
    let request = signed
        .msg
        .as_deref()
        .ok_or_else(|| Error::InvalidLicenseMessage("Missing request message".to_string()))
        .and_then(|msg| {
            LicenseRequest::decode(msg).map_err(|e| {
                Error::InvalidLicenseMessage(format!("Failed to parse LicenseRequest: {}", e))
            })
        })?;
    Ok((signed, request))
}

/// The request id a license request carries in its content identification.
pub fn request_id(request: &LicenseRequest) -> Option<&[u8]> {
    match request.content_id.as_ref()?.content_id_variant.as_ref()? {
        ContentIdVariant::WidevinePsshData(data) => data.request_id.as_deref(),
    }
}

/// Encrypt a client identification for the holder of a service certificate.
///
/// The client id is encrypted with AES-128-CBC under a fresh privacy key,
/// and the privacy key is wrapped with RSA-OAEP to the certificate key.
pub fn encrypt_client_id(
    client_id: &ClientIdentification,
    service_certificate: &ServiceCertificate,
) -> Result<EncryptedClientIdentification> {
    let privacy_key = zeroize::Zeroizing::new(crypto::random_bytes::<16>());
    let privacy_iv = crypto::random_bytes::<16>();
    let sealed = seal_client_id(
        client_id,
        service_certificate.public_key(),
        &privacy_key,
        &privacy_iv,
    )?;

    Ok(EncryptedClientIdentification {
        provider_id: service_certificate.provider_id().map(str::to_string),
        service_certificate_serial_number: Some(service_certificate.serial_number().to_vec()),
        encrypted_client_id: Some(sealed.encrypted_client_id),
        encrypted_client_id_iv: Some(privacy_iv.to_vec()),
        encrypted_privacy_key: Some(sealed.encrypted_privacy_key),
    })
}

struct SealedClientId {
    encrypted_client_id: Vec<u8>,
    encrypted_privacy_key: Vec<u8>,
}

fn seal_client_id(
    client_id: &ClientIdentification,
    public_key: &RsaPublicKey,
    privacy_key: &[u8; 16],
    privacy_iv: &[u8; 16],
) -> Result<SealedClientId> {
    Ok(SealedClientId {
        encrypted_client_id: crypto::aes_cbc_encrypt(
            privacy_key,
            privacy_iv,
            &client_id.encode_to_vec(),
        )?,
        encrypted_privacy_key: crypto::rsa_oaep_encrypt(public_key, privacy_key)?,
    })
}

/// A structurally valid license response.
#[derive(Debug, Clone)]
pub struct LicenseResponse {
    /// RSA-OAEP wrapped session key.
    pub session_key: Vec<u8>,
    /// HMAC-SHA256 over `core_message || msg`.
    pub signature: Vec<u8>,
    pub core_message: Option<Vec<u8>>,
    /// Serialized `License`, exactly as signed.
    pub msg: Vec<u8>,
    pub license: License,
}

impl LicenseResponse {
    pub fn key_containers(&self) -> &[KeyContainer] {
        &self.license.key
    }
}

/// Decode a license response and check it answers `expected_request_id`.
///
/// A response whose echoed request id is missing or different fails with
/// [`Error::ResponseBindingMismatch`]; every structural problem fails with
/// [`Error::InvalidLicenseMessage`].
pub fn decode_license_response(data: &[u8], expected_request_id: &[u8]) -> Result<LicenseResponse> {
    let signed = SignedMessage::decode(data).map_err(|e| {
        Error::InvalidLicenseMessage(format!("Failed to parse SignedMessage: {}", e))
    })?;

    match signed.r#type.map(MessageType::try_from) {
        Some(Ok(MessageType::License)) => {}
        Some(Ok(MessageType::ErrorResponse)) => {
            return Err(Error::InvalidLicenseMessage(
                "Server returned an error response".to_string(),
            ))
        }
        _ => {
            return Err(Error::InvalidLicenseMessage(
                "Expected LICENSE message".to_string(),
            ))
        }
    }

    let msg = signed
        .msg
        .ok_or_else(|| Error::InvalidLicenseMessage("Missing license message".to_string()))?;
    let license = License::decode(msg.as_slice())
        .map_err(|e| Error::InvalidLicenseMessage(format!("Failed to parse License: {}", e)))?;

    let request_id = license
        .id
        .as_ref()
        .and_then(|id| id.request_id.as_deref())
        .ok_or_else(|| Error::ResponseBindingMismatch("license has no request id".to_string()))?;
    if request_id != expected_request_id {
        return Err(Error::ResponseBindingMismatch(
            "license request id does not match this session".to_string(),
        ));
    }

    let session_key = signed
        .session_key
        .ok_or_else(|| Error::InvalidLicenseMessage("Missing session_key".to_string()))?;
    let signature = signed
        .signature
        .ok_or_else(|| Error::InvalidLicenseMessage("Missing signature".to_string()))?;

    Ok(LicenseResponse {
        session_key,
        signature,
        core_message: signed.oemcrypto_core_message,
        msg,
        license,
    })
}

/// Unwrap a service certificate, bare or inside a `SignedMessage`.
///
/// No signature check happens here, see [`ServiceCertificate::from_bytes`].
pub fn decode_service_certificate(data: &[u8]) -> Result<SignedDrmCertificate> {
    // Field 1 is a varint in SignedMessage and bytes in SignedDrmCertificate,
    // so a bare certificate never decodes as a SignedMessage.
    if let Ok(message) = SignedMessage::decode(data) {
        if message.r#type == Some(MessageType::ServiceCertificate as i32) {
            let msg = message.msg.ok_or_else(|| {
                Error::InvalidServiceCertificate("SignedMessage has no body".to_string())
            })?;
            return SignedDrmCertificate::decode(msg.as_slice()).map_err(|e| {
                Error::InvalidServiceCertificate(format!("SignedDrmCertificate: {}", e))
            });
        }
    }

    SignedDrmCertificate::decode(data)
        .map_err(|e| Error::InvalidServiceCertificate(format!("SignedDrmCertificate: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license_protocol::LicenseIdentification;

    fn signed_license(request_id: Option<&[u8]>) -> Vec<u8> {
        let license = License {
            id: Some(LicenseIdentification {
                request_id: request_id.map(<[u8]>::to_vec),
                ..Default::default()
            }),
            ..Default::default()
        };
        SignedMessage {
            r#type: Some(MessageType::License as i32),
            msg: Some(license.encode_to_vec()),
            signature: Some(vec![0u8; 32]),
            session_key: Some(vec![1u8; 256]),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn sealed_client_id_opens_with_the_certificate_key() {
        use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
        use rsa::Oaep;
        use sha1::Sha1;

        let server_key = crate::testutil::other_private_key();
        let client_id = crate::testutil::client_id_for(&crate::testutil::private_key());
        let privacy_key = [0x5Au8; 16];
        let privacy_iv = [0xA5u8; 16];

        let sealed = seal_client_id(
            &client_id,
            &RsaPublicKey::from(&server_key),
            &privacy_key,
            &privacy_iv,
        )
        .expect("seal");

        let unwrapped = server_key
            .decrypt(Oaep::new::<Sha1>(), &sealed.encrypted_privacy_key)
            .expect("unwrap privacy key");
        assert_eq!(unwrapped, privacy_key);

        let plaintext = cbc::Decryptor::<aes::Aes128>::new_from_slices(&unwrapped, &privacy_iv)
            .expect("cipher")
            .decrypt_padded_vec_mut::<Pkcs7>(&sealed.encrypted_client_id)
            .expect("decrypt client id");
        assert_eq!(plaintext, client_id.encode_to_vec());
        assert_eq!(
            ClientIdentification::decode(plaintext.as_slice()).expect("client id"),
            client_id
        );
    }

    #[test]
    fn encrypted_client_id_names_the_certificate() {
        let cert = ServiceCertificate::common().expect("common cert");
        let client_id = crate::testutil::client_id_for(&crate::testutil::private_key());
        let encrypted = encrypt_client_id(&client_id, &cert).expect("encrypt");

        assert_eq!(encrypted.provider_id.as_deref(), Some("license.widevine.com"));
        assert_eq!(
            encrypted.service_certificate_serial_number.as_deref(),
            Some(cert.serial_number())
        );
        assert_eq!(encrypted.encrypted_privacy_key.map(|k| k.len()), Some(256));
        // PKCS#7 always pads, so the ciphertext is strictly longer.
        let ciphertext = encrypted.encrypted_client_id.expect("ciphertext");
        assert_eq!(ciphertext.len() % 16, 0);
        assert!(ciphertext.len() > client_id.encode_to_vec().len());
    }

    #[test]
    fn license_type_names() {
        assert_eq!(
            parse_license_type("streaming").expect("type"),
            LicenseType::Streaming
        );
        assert_eq!(
            parse_license_type("OFFLINE").expect("type"),
            LicenseType::Offline
        );
        assert!(matches!(
            parse_license_type("RENTAL"),
            Err(Error::InvalidLicenseType(_))
        ));
    }

    #[test]
    fn decode_checks_request_binding() {
        let data = signed_license(Some(b"request-1"));
        let response = decode_license_response(&data, b"request-1").expect("decode");
        assert!(response.key_containers().is_empty());
        assert!(response.core_message.is_none());

        let err = decode_license_response(&data, b"request-2").expect_err("mismatch");
        assert!(matches!(err, Error::ResponseBindingMismatch(_)));

        let err = decode_license_response(&signed_license(None), b"request-1")
            .expect_err("missing request id");
        assert!(matches!(err, Error::ResponseBindingMismatch(_)));
    }

    #[test]
    fn decode_rejects_wrong_message_type() {
        let data = SignedMessage {
            r#type: Some(MessageType::ErrorResponse as i32),
            msg: Some(Vec::new()),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_license_response(&data, b"x").expect_err("error response");
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_license_response(&[0xff, 0xff, 0xff], b"x").expect_err("garbage");
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
    }

    #[test]
    fn decode_rejects_missing_session_key() {
        let license = License {
            id: Some(LicenseIdentification {
                request_id: Some(b"r".to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let data = SignedMessage {
            r#type: Some(MessageType::License as i32),
            msg: Some(license.encode_to_vec()),
            signature: Some(vec![0u8; 32]),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_license_response(&data, b"r").expect_err("no session key");
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut data = signed_license(Some(b"req"));
        // Field 15, varint 1: not part of the schema.
        data.extend_from_slice(&[0x78, 0x01]);
        assert!(decode_license_response(&data, b"req").is_ok());
    }

    #[test]
    fn service_certificate_challenge_is_a_signed_message() {
        let message = SignedMessage::decode(SERVICE_CERTIFICATE_CHALLENGE).expect("decode");
        assert_eq!(
            message.r#type,
            Some(MessageType::ServiceCertificateRequest as i32)
        );
    }
}
