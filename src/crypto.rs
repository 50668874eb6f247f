//! Key derivation and verification engine.
//!
//! Every primitive the license exchange needs lives here: RSA-OAEP session
//! key recovery, the AES-CMAC counter-mode KDF, HMAC-SHA256 license
//! verification, AES-128-CBC key unwrapping, and RSA-PSS request signing.
//! Nothing in this module performs I/O or logs key material.

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::Cmac;
use hmac::{Hmac, Mac};
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec::LicenseResponse;
use crate::error::{Error, Result};
use crate::key::Key;

type HmacSha256 = Hmac<Sha256>;
type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const ENCRYPTION_LABEL: &[u8] = b"ENCRYPTION";
const AUTHENTICATION_LABEL: &[u8] = b"AUTHENTICATION";

/// Output length in bits of the encryption key derivation.
const ENC_KEY_BITS: u32 = 16 * 8;
/// Output length in bits of the two concatenated MAC key derivations.
const MAC_KEY_BITS: u32 = 32 * 8 * 2;

/// Derivation inputs built from one serialized license request.
///
/// The request bytes carry the session nonce (request id and key control
/// nonce), so both contexts are bound to exactly one challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivationContext {
    pub enc: Vec<u8>,
    pub mac: Vec<u8>,
}

impl std::fmt::Debug for DerivationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationContext")
            .field("enc_len", &self.enc.len())
            .field("mac_len", &self.mac.len())
            .finish()
    }
}

/// Symmetric keys derived from a license session key.
///
/// Zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Unwraps content keys.
    pub enc_key: [u8; 16],
    /// Verifies license signatures.
    pub mac_key_server: [u8; 32],
    /// Signs renewal requests.
    pub mac_key_client: [u8; 32],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKeys { .. }")
    }
}

/// Build the encryption and authentication contexts for a license request.
///
/// `label || 0x00 || request || output_bits (u32 BE)`.
#[must_use]
pub fn derive_context(request: &[u8]) -> DerivationContext {
    fn context(label: &[u8], request: &[u8], bits: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(label.len() + 1 + request.len() + 4);
        out.extend_from_slice(label);
        out.push(0);
        out.extend_from_slice(request);
        out.extend_from_slice(&bits.to_be_bytes());
        out
    }

    DerivationContext {
        enc: context(ENCRYPTION_LABEL, request, ENC_KEY_BITS),
        mac: context(AUTHENTICATION_LABEL, request, MAC_KEY_BITS),
    }
}

/// Derive the encryption and MAC keys from a 16-byte session key.
///
/// ```text
/// enc_key        = CMAC(k, 01 || enc_ctx)
/// mac_key_server = CMAC(k, 01 || mac_ctx) || CMAC(k, 02 || mac_ctx)
/// mac_key_client = CMAC(k, 03 || mac_ctx) || CMAC(k, 04 || mac_ctx)
/// ```
pub fn derive_keys(context: &DerivationContext, session_key: &[u8]) -> Result<DerivedKeys> {
    let derive = |counter: u8, ctx: &[u8]| -> Result<[u8; 16]> {
        let mut mac = <CmacAes128 as Mac>::new_from_slice(session_key).map_err(|_| {
            Error::Crypto(format!(
                "Session key must be 16 bytes, got {}",
                session_key.len()
            ))
        })?;
        mac.update(&[counter]);
        mac.update(ctx);
        Ok(mac.finalize().into_bytes().into())
    };

    let mut keys = DerivedKeys {
        enc_key: derive(1, &context.enc)?,
        mac_key_server: [0u8; 32],
        mac_key_client: [0u8; 32],
    };
    keys.mac_key_server[..16].copy_from_slice(&derive(1, &context.mac)?);
    keys.mac_key_server[16..].copy_from_slice(&derive(2, &context.mac)?);
    keys.mac_key_client[..16].copy_from_slice(&derive(3, &context.mac)?);
    keys.mac_key_client[16..].copy_from_slice(&derive(4, &context.mac)?);
    Ok(keys)
}

/// Unwrap the license session key with the device private key (RSA-OAEP-SHA1).
///
/// A failure here means the license was issued for a different key pair.
pub fn decrypt_session_key(
    private_key: &RsaPrivateKey,
    encrypted: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    private_key
        .decrypt(Oaep::new::<Sha1>(), encrypted)
        .map(Zeroizing::new)
        .map_err(|_| Error::SessionKeyDecryption)
}

/// Wrap `data` for the holder of `public_key` (RSA-OAEP-SHA1).
pub fn rsa_oaep_encrypt(public_key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut rng = OsRng;
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha1>(), data)
        .map_err(|e| Error::Crypto(format!("RSA-OAEP encryption failed: {}", e)))
}

fn license_mac(mac_key: &[u8], core_message: Option<&[u8]>, msg: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))?;
    if let Some(core) = core_message {
        mac.update(core);
    }
    mac.update(msg);
    Ok(mac)
}

/// Compute the HMAC-SHA256 signature of a license body.
///
/// The signed bytes are the OEMCrypto core message (when present) followed
/// by the serialized `License`.
pub fn sign_license(mac_key: &[u8], core_message: Option<&[u8]>, msg: &[u8]) -> Result<Vec<u8>> {
    Ok(license_mac(mac_key, core_message, msg)?
        .finalize()
        .into_bytes()
        .to_vec())
}

/// Verify a license signature in constant time.
pub fn verify_license_signature(
    mac_key: &[u8],
    core_message: Option<&[u8]>,
    msg: &[u8],
    signature: &[u8],
) -> Result<()> {
    license_mac(mac_key, core_message, msg)?
        .verify_slice(signature)
        .map_err(|_| Error::SignatureVerificationFailed)
}

/// Encrypt with AES-128-CBC and PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| {
        Error::Crypto(format!(
            "Invalid AES-CBC key/IV length: {}/{}",
            key.len(),
            iv.len()
        ))
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt a content key (AES-128-CBC, PKCS#7).
pub fn decrypt_key(enc_key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes128CbcDec::new_from_slices(enc_key, iv).map_err(|_| {
        Error::InvalidLicenseMessage(format!(
            "Invalid key container IV length: expected 16, got {}",
            iv.len()
        ))
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| Error::InvalidLicenseMessage("Content key padding is invalid".to_string()))
}

/// Sign a serialized license request with RSA-PSS over SHA-1.
pub fn sign_request(private_key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
    let hash = Sha1::digest(message);
    let mut rng = OsRng;
    private_key
        .sign_with_rng(&mut rng, Pss::new::<Sha1>(), &hash)
        .map_err(|e| Error::Crypto(format!("RSA-PSS signing failed: {}", e)))
}

/// Verify an RSA-PSS-SHA1 signature.
pub fn verify_pss_sha1(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let hash = Sha1::digest(message);
    public_key
        .verify(Pss::new::<Sha1>(), &hash, signature)
        .is_ok()
}

/// Recover the content keys of a decoded license response.
///
/// Order matters: the session key is unwrapped, the keys are derived from
/// the request context, and the signature must verify before any key
/// container is decrypted.
pub fn process_license(
    private_key: &RsaPrivateKey,
    context: &DerivationContext,
    response: &LicenseResponse,
) -> Result<(DerivedKeys, Vec<Key>)> {
    let session_key = decrypt_session_key(private_key, &response.session_key)?;
    let derived = derive_keys(context, &session_key)?;

    verify_license_signature(
        &derived.mac_key_server,
        response.core_message.as_deref(),
        &response.msg,
        &response.signature,
    )?;

    let keys = response
        .license
        .key
        .iter()
        .map(|container| Key::from_key_container(container, &derived.enc_key))
        .collect::<Result<Vec<_>>>()?;

    Ok((derived, keys))
}

/// Fill a fixed-size array from the OS RNG.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_context_contains_labels() {
        let message = b"test-message";
        let ctx = derive_context(message);

        assert!(ctx.enc.starts_with(b"ENCRYPTION\0"));
        assert!(ctx.mac.starts_with(b"AUTHENTICATION\0"));
        assert!(ctx.enc.ends_with(&[0, 0, 0, 0x80]));
        assert!(ctx.mac.ends_with(&[0, 0, 2, 0]));
        assert!(ctx.enc.windows(message.len()).any(|w| w == message));
    }

    // Known answers for session key 00..0f and the request bytes below.
    const KAT_REQUEST: &[u8] = b"\x08\x01\x12\x10vinecdm-request!";
    const KAT_ENC_KEY: &str = "89b6efb2f08defc908f116e84245eb44";
    const KAT_MAC_KEY_SERVER: &str =
        "30aefad291901963038f5069cf7d544c1b512533c36e5d24e51b7508be8945b1";
    const KAT_MAC_KEY_CLIENT: &str =
        "8baed22a7b06b542371d394f795a406d3fdbc3de525faa21d8ed56a9bc426578";

    fn kat_session_key() -> [u8; 16] {
        std::array::from_fn(|i| i as u8)
    }

    #[test]
    fn derive_keys_known_answer() {
        let keys = derive_keys(&derive_context(KAT_REQUEST), &kat_session_key()).expect("derive");
        assert_eq!(hex::encode(keys.enc_key), KAT_ENC_KEY);
        assert_eq!(hex::encode(keys.mac_key_server), KAT_MAC_KEY_SERVER);
        assert_eq!(hex::encode(keys.mac_key_client), KAT_MAC_KEY_CLIENT);
    }

    #[test]
    fn license_signature_known_answer() {
        let mac_key = hex::decode(KAT_MAC_KEY_SERVER).expect("hex");
        let signature = sign_license(&mac_key, Some(b"core"), b"license body").expect("sign");
        assert_eq!(
            hex::encode(&signature),
            "b76e994ab042a28782ae968f5a6b8d8a53ed049751c8c896a428c9823bdb92c3"
        );
    }

    #[test]
    fn decrypt_key_known_answer() {
        let enc_key = hex::decode(KAT_ENC_KEY).expect("hex");
        let iv: [u8; 16] = std::array::from_fn(|i| 16 + i as u8);
        let wrapped = hex::decode(
            "ab06242b347660887de02c1e5cb3e7b2b6a3fc43f83b6574ac79302d7a718b6e",
        )
        .expect("hex");
        let key = decrypt_key(&enc_key, &iv, &wrapped).expect("decrypt");
        assert_eq!(hex::encode(key.as_slice()), "100b6c20940f779a4589152b57d2dacb");
    }

    #[test]
    fn derive_keys_lengths_and_separation() {
        let ctx = derive_context(b"context");
        let keys = derive_keys(&ctx, &[7u8; 16]).expect("derive");

        assert_ne!(keys.mac_key_server[..16], keys.enc_key[..]);
        assert_ne!(keys.mac_key_server, keys.mac_key_client);
    }

    #[test]
    fn derive_keys_depends_on_request() {
        let a = derive_keys(&derive_context(b"request-a"), &[1u8; 16]).expect("derive");
        let b = derive_keys(&derive_context(b"request-b"), &[1u8; 16]).expect("derive");
        assert_ne!(a.enc_key, b.enc_key);
        assert_ne!(a.mac_key_server, b.mac_key_server);
    }

    #[test]
    fn derive_keys_rejects_short_session_key() {
        let err = derive_keys(&derive_context(b"x"), &[0u8; 8]).expect_err("short key");
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn license_signature_every_bit_flip_fails() {
        let mac_key = [0x42u8; 32];
        let msg = b"license body";
        let signature = sign_license(&mac_key, None, msg).expect("sign");
        verify_license_signature(&mac_key, None, msg, &signature).expect("verify");

        for bit in 0..signature.len() * 8 {
            let mut flipped = signature.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            let err = verify_license_signature(&mac_key, None, msg, &flipped)
                .expect_err("flipped signature must fail");
            assert!(matches!(err, Error::SignatureVerificationFailed));
        }
    }

    #[test]
    fn license_signature_covers_core_message() {
        let mac_key = [0x11u8; 32];
        let signature = sign_license(&mac_key, Some(b"core"), b"msg").expect("sign");
        assert!(verify_license_signature(&mac_key, Some(b"core"), b"msg", &signature).is_ok());
        assert!(verify_license_signature(&mac_key, None, b"msg", &signature).is_err());
    }

    #[test]
    fn content_key_cbc_roundtrip() {
        let enc_key = [3u8; 16];
        let iv = [9u8; 16];
        let content_key = hex::decode("00112233445566778899aabbccddeeff").expect("hex");

        let wrapped = aes_cbc_encrypt(&enc_key, &iv, &content_key).expect("encrypt");
        assert_eq!(wrapped.len(), 32);
        let unwrapped = decrypt_key(&enc_key, &iv, &wrapped).expect("decrypt");
        assert_eq!(unwrapped.as_slice(), content_key.as_slice());
    }

    #[test]
    fn decrypt_key_rejects_bad_iv() {
        let err = decrypt_key(&[0u8; 16], &[0u8; 8], &[0u8; 16]).expect_err("bad iv");
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
    }
}
