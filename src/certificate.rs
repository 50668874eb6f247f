//! Service certificates and the compiled-in trust anchor.
//!
//! A license server may publish a service certificate so that clients can
//! encrypt their client identification (privacy mode). Certificates are only
//! accepted when they are signed by the Widevine root.

use std::sync::LazyLock;

use base64::Engine;
use prost::Message;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;

use crate::codec;
use crate::crypto;
use crate::error::{Error, Result};
use crate::license_protocol::{drm_certificate, DrmCertificate, SignedDrmCertificate};

/// Service certificate of the common Widevine license server.
pub const COMMON_PRIVACY_CERT: &str = concat!(
    "CAUSxwUKwQIIAxIQFwW5F8wSBIaLBjM6L3cqjBiCtIKSBSKOAjCCAQoCggEBAJntWzsy",
    "fateJO/DtiqVtZhSCtW8yzdQPgZFuBTYdrjfQFEEQa2M462xG7iMTnJaXkqeB5Up",
    "HVhYQCOn4a8OOKkSeTkwCGELbxWMh4x+Ib/7/up34QGeHleB6KRfRiY9FOYOgFioY",
    "Hrc4E+shFexN6jWfM3rM3BdmDoh+07svUoQykdJDKR+ql1DghjduvHK3jOS8T1v+",
    "2RC/THhv0CwxgTRxLpMlSCkv5fuvWCSmvzu9Vu69WTi0Ods18Vcc6CCuZYSC4NZ7",
    "c4kcHCCaA1vZ8bYLErF8xNEkKdO7DevSy8BDFnoKEPiWC8La59dsPxebt9k+9MI",
    "tHEbzxJQAZyfWgkCAwEAAToUbGljZW5zZS53aWRldmluZS5jb20SgAOuNHMUtag1",
    "KX8nE4j7e7jLUnfSSYI83dHaMLkzOVEes8y96gS5RLknwSE0bv296snUE5F+bsF2",
    "oQQ4RgpQO8GVK5uk5M4PxL/CCpgIqq9L/NGcHc/N9XTMrCjRtBBBbPneiAQwHL2z",
    "NMr80NQJeEI6ZC5UYT3wr8+WykqSSdhV5Cs6cD7xdn9qm9Nta/gr52u/DLpP3lnS",
    "q8x2/rZCR7hcQx+8pSJmthn8NpeVQ/ypy727+voOGlXnVaPHvOZV+WRvWCq5z3Cq",
    "CLl5+Gf2Ogsrf9s2LFvE7NVV2FvKqcWTw4PIV9Sdqrd+QLeFHd/SSZiAjjWyWOdd",
    "eOrAyhb3BHMEwg2T7eTo/xxvF+YkPj89qPwXCYcOxF+6gjomPwzvofcJOxkJkoMm",
    "MzcFBDopvab5tDQsyN9UPLGhGC98X/8z8QSQ+spbJTYLdgFenFoGq47gLwDS6NWY",
    "YQSqzE3Udf2W7pzk4ybyG4PHBYV3s4cyzdq8amvtE/sNSdOKReuHpfQ="
);

/// Service certificate of the staging license server.
pub const STAGING_PRIVACY_CERT: &str = concat!(
    "CAUSxQUKvwIIAxIQKHA0VMAI9jYYredEPbbEyBiL5/mQBSKOAjCCAQoCggEBALUhEr",
    "jQXQI/zF2V4sJRwcZJtBd82NK+7zVbsGdD3mYePSq8MYK3mUbVX9wI3+lUB4Femm",
    "J0syKix/XgZ7tfCsB6idRa6pSyUW8HW2bvgR0NJuG5priU8rmFeWKqFxxPZmMNPk",
    "xgJxiJf14e+baq9a1Nuip+FBdt8TSh0xhbWiGKwFpMQfCB7/+Ao6BAxQsJu8dA7t",
    "zY8U1nWpGYD5LKfdxkagatrVEB90oOSYzAHwBTK6wheFC9kF6QkjZWt9/v70JIZ2",
    "fzPvYoPU9CVKtyWJOQvuVYCPHWaAgNRdiTwryi901goMDQoJk87wFgRwMzTDY4E5",
    "SGvJ2vJP1noH+a2UMCAwEAAToSc3RhZ2luZy5nb29nbGUuY29tEoADmD4wNSZ19A",
    "unFfwkm9rl1KxySaJmZSHkNlVzlSlyH/iA4KrvxeJ7yYDa6tq/P8OG0ISgLIJTeE",
    "jMdT/0l7ARp9qXeIoA4qprhM19ccB6SOv2FgLMpaPzIDCnKVww2pFbkdwYubyVk7",
    "jei7UPDe3BKTi46eA5zd4Y+oLoG7AyYw/pVdhaVmzhVDAL9tTBvRJpZjVrKH1lex",
    "jOY9Dv1F/FJp6X6rEctWPlVkOyb/SfEJwhAa/K81uDLyiPDZ1Flg4lnoX7XSTb0s",
    "+Cdkxd2b9yfvvpyGH4aTIfat4YkF9Nkvmm2mU224R1hx0WjocLsjA89wxul4TJPS",
    "3oRa2CYr5+DU4uSgdZzvgtEJ0lksckKfjAF0K64rPeytvDPD5fS69eFuy3Tq26/L",
    "fGcF96njtvOUA4P5xRFtICogySKe6WnCUZcYMDtQ0BMMM1LgawFNg4VA+KDCJ8AB",
    "Hg9bOOTimO0sswHrRWSWX1XF15dXolCk65yEqz5lOfa2/fVomeopkU"
);

const ROOT_SIGNED_CERT_B64: &str = concat!(
    "CpwDCAASAQAY3ZSIiwUijgMwggGKAoIBgQC0/jnDZZAD2zwRlwnoaM3yw16b8ud",
    "NI7EQ24dl39z7nzWgVwNTTPZtNX2meNuzNtI/nECplSZyf7i+Zt/FIZh4FRZoXS9",
    "GDkPLioQ5q/uwNYAivjQji6tTW3LsS7VIaVM+R1/9Cf2ndhOPD5LWTN+udqm62SI",
    "QqZ1xRdbX4RklhZxTmpfrhNfMqIiCIHAmIP1+QFAn4iWTb7w+cqD6wb0ptE2CXMG",
    "0y5xyfrDpihc+GWP8/YJIK7eyM7l97Eu6iR8nuJuISISqGJIOZfXIbBH/azbkdDT",
    "KjDOx+biOtOYS4AKYeVJeRTP/Edzrw1O6fGAaET0A+9K3qjD6T15Id1sX3HXvb9I",
    "Zbdy+f7B4j9yCYEy/5CkGXmmMOROtFCXtGbLynwGCDVZEiMg17B8RsyTgWQ035Ec",
    "86kt/lzEcgXyUikx9aBWE/6UI/Rjn5yvkRycSEbgj7FiTPKwS0ohtQT3F/hzcufj",
    "UUT4H5QNvpxLoEve1zqaWVT94tGSCUNIzX5ECAwEAARKAA1jx1k0ECXvf1+9dOwI",
    "5F/oUNnVKOGeFVxKnFO41FtU9v0KG9mkAds2T9Hyy355EzUzUrgkYU0Qy7OBhG+X",
    "aE9NVxd0ay5AeflvG6Q8in76FAv6QMcxrA4S9IsRV+vXyCM1lQVjofSnaBFiC9Td",
    "pvPNaV4QXezKHcLKwdpyywxXRESYqI3WZPrl3IjINvBoZwdVlkHZVdA8OaU1fTY8",
    "Zr9/WFjGUqJJfT7x6Mfiujq0zt+kw0IwKimyDNfiKgbL+HIisKmbF/73mF9BiC9",
    "yKRfewPlrIHkokL2yl4xyIFIPVxe9enz2FRXPia1BSV0z7kmxmdYrWDRuu8+yvUS",
    "IDXQouY5OcCwEgqKmELhfKrnPsIht5rvagcizfB0fbiIYwFHghESKIrNdUdPnzJs",
    "KlVshWTwApHQh7evuVicPumFSePGuUBRMS9nG5qxPDDJtGCHs9Mmpoyh6ckGLF7R",
    "C5HxclzpC5bc3ERvWjYhN0AqdipPpV2d7PouaAdFUGSdUCDA=="
);

/// Root public key, decoded once from the compiled-in certificate.
static ROOT_PUBLIC_KEY: LazyLock<std::result::Result<RsaPublicKey, String>> =
    LazyLock::new(|| {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ROOT_SIGNED_CERT_B64)
            .map_err(|e| format!("root certificate base64: {}", e))?;
        let signed = SignedDrmCertificate::decode(bytes.as_slice())
            .map_err(|e| format!("root SignedDrmCertificate: {}", e))?;
        let cert = signed
            .drm_certificate
            .as_deref()
            .ok_or("root certificate is empty")
            .and_then(|b| DrmCertificate::decode(b).map_err(|_| "root DrmCertificate"))?;
        let public_key = cert.public_key.ok_or("root public key is missing")?;
        RsaPublicKey::from_pkcs1_der(&public_key).map_err(|e| format!("root public key: {}", e))
    });

/// A service certificate that has been verified against the root.
#[derive(Debug, Clone)]
pub struct ServiceCertificate {
    signed: SignedDrmCertificate,
    certificate: DrmCertificate,
    public_key: RsaPublicKey,
}

impl ServiceCertificate {
    /// Parse and verify a certificate, bare or wrapped in a `SignedMessage`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let signed = codec::decode_service_certificate(data)?;
        Self::from_signed(signed)
    }

    pub fn from_base64(data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::InvalidServiceCertificate(format!("base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// The certificate of `license.widevine.com`.
    pub fn common() -> Result<Self> {
        Self::from_base64(COMMON_PRIVACY_CERT)
    }

    /// The certificate of `staging.google.com`.
    pub fn staging() -> Result<Self> {
        Self::from_base64(STAGING_PRIVACY_CERT)
    }

    fn from_signed(signed: SignedDrmCertificate) -> Result<Self> {
        let cert_bytes = signed.drm_certificate.as_deref().ok_or_else(|| {
            Error::InvalidServiceCertificate("missing DRM certificate".to_string())
        })?;
        let signature = signed
            .signature
            .as_deref()
            .ok_or_else(|| Error::InvalidServiceCertificate("missing signature".to_string()))?;

        let root = ROOT_PUBLIC_KEY
            .as_ref()
            .map_err(|e| Error::InvalidServiceCertificate(e.clone()))?;
        if !crypto::verify_pss_sha1(root, cert_bytes, signature) {
            return Err(Error::InvalidServiceCertificate(
                "signature does not verify against the root certificate".to_string(),
            ));
        }

        let certificate = DrmCertificate::decode(cert_bytes)
            .map_err(|e| Error::InvalidServiceCertificate(format!("DrmCertificate: {}", e)))?;
        match certificate.r#type.map(drm_certificate::Type::try_from) {
            Some(Ok(drm_certificate::Type::Service)) => {}
            other => {
                return Err(Error::InvalidServiceCertificate(format!(
                    "not a service certificate (type {:?})",
                    other.and_then(|t| t.ok())
                )))
            }
        }
        let public_key = certificate
            .public_key
            .as_deref()
            .ok_or_else(|| Error::InvalidServiceCertificate("missing public key".to_string()))
            .and_then(|der| {
                RsaPublicKey::from_pkcs1_der(der)
                    .map_err(|e| Error::InvalidServiceCertificate(format!("public key: {}", e)))
            })?;

        Ok(Self {
            signed,
            certificate,
            public_key,
        })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.certificate.provider_id.as_deref()
    }

    pub fn serial_number(&self) -> &[u8] {
        self.certificate.serial_number.as_deref().unwrap_or_default()
    }

    pub fn signed_certificate(&self) -> &SignedDrmCertificate {
        &self.signed
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.signed.encode_to_vec()
    }
}
