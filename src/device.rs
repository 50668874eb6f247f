//! Device identity store.
//!
//! A device is an RSA private key plus the `ClientIdentification` blob that
//! carries the matching certificate. Two on-disk layouts are supported:
//!
//! - a packed `.wvd` file (v1 or v2), and
//! - a directory of separate files:
//!   `wv.json`, `device_private_key`, `device_client_id_blob` and an optional
//!   `device_vmp_blob`.
//!
//! v2 stores VMP data inside the ClientIdentification message. v1 and the
//! directory layout store it separately; it is merged into the client id
//! when the client id does not already carry it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;

use crate::error::{DeviceFormatError, Error, Result};
use crate::license_protocol::{
    ClientIdentification, DrmCertificate, FileHashes, SignedDrmCertificate,
};

/// Magic bytes for WVD files.
const WVD_MAGIC: &[u8; 3] = b"WVD";

/// Version written by [`Device::to_bytes`].
const WVD_VERSION: u8 = 2;

/// Required RSA modulus size.
const PRIVATE_KEY_BITS: usize = 2048;

/// Flags bit: put a key control nonce in license requests.
pub const FLAG_SEND_KEY_CONTROL_NONCE: u8 = 0b0000_0001;

/// Name of the packed file looked up inside a device directory.
pub const PACKED_FILE_NAME: &str = "device.wvd";
pub const CONFIG_FILE_NAME: &str = "wv.json";
pub const PRIVATE_KEY_FILE_NAME: &str = "device_private_key";
pub const CLIENT_ID_FILE_NAME: &str = "device_client_id_blob";
pub const VMP_FILE_NAME: &str = "device_vmp_blob";

/// Device types supported by Widevine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    /// Chrome CDM device.
    Chrome = 1,
    /// Android CDM device.
    Android = 2,
}

impl TryFrom<u8> for DeviceType {
    type Error = DeviceFormatError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(DeviceType::Chrome),
            2 => Ok(DeviceType::Android),
            _ => Err(DeviceFormatError::BadDeviceType(value.to_string())),
        }
    }
}

impl From<DeviceType> for u8 {
    fn from(device_type: DeviceType) -> Self {
        device_type as u8
    }
}

impl std::str::FromStr for DeviceType {
    type Err = DeviceFormatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(DeviceType::Chrome),
            "android" => Ok(DeviceType::Android),
            _ => Err(DeviceFormatError::BadDeviceType(s.to_string())),
        }
    }
}

impl DeviceType {
    /// Flags of a device whose `wv.json` does not set them.
    ///
    /// Android devices send a key control nonce, Chrome devices do not.
    pub fn default_flags(self) -> u8 {
        match self {
            DeviceType::Android => FLAG_SEND_KEY_CONTROL_NONCE,
            DeviceType::Chrome => 0,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Chrome => f.write_str("chrome"),
            DeviceType::Android => f.write_str("android"),
        }
    }
}

/// Where a device is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    Packed(PathBuf),
    Directory(PathBuf),
}

impl DeviceSource {
    /// A file is packed. A directory is packed when it holds `device.wvd`,
    /// else it is read as separate files.
    pub fn detect<P: AsRef<Path>>(path: P) -> std::result::Result<Self, DeviceFormatError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() {
            return Ok(DeviceSource::Packed(path.to_path_buf()));
        }
        let packed = path.join(PACKED_FILE_NAME);
        if packed.is_file() {
            Ok(DeviceSource::Packed(packed))
        } else {
            Ok(DeviceSource::Directory(path.to_path_buf()))
        }
    }
}

/// Contents of `wv.json`.
#[derive(Debug, Deserialize)]
struct DirectoryConfig {
    session_id_type: String,
    security_level: u8,
    #[serde(default)]
    send_key_control_nonce: Option<bool>,
}

/// Widevine device credentials.
///
/// Immutable once loaded and safe to share across sessions.
#[derive(Clone)]
pub struct Device {
    /// Device type (Chrome or Android).
    pub device_type: DeviceType,
    /// Security level (1-3, where 1 is highest).
    pub security_level: u8,
    /// Device flags. Bit 0 is [`FLAG_SEND_KEY_CONTROL_NONCE`]; the other
    /// bits are preserved as read.
    pub flags: u8,
    /// RSA private key for signing.
    pub private_key: RsaPrivateKey,
    /// Client identification blob.
    pub client_id: ClientIdentification,
    /// Verified Media Path (VMP) data.
    pub vmp: Option<FileHashes>,
    /// System ID extracted from the DRM certificate.
    pub system_id: u32,
    key_pair_matches: OnceLock<bool>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_type", &self.device_type)
            .field("security_level", &self.security_level)
            .field("flags", &self.flags)
            .field("system_id", &self.system_id)
            .field("has_vmp", &self.vmp.is_some())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.device_type == other.device_type
            && self.security_level == other.security_level
            && self.flags == other.flags
            && self.private_key == other.private_key
            && self.client_id == other.client_id
    }
}

impl Device {
    /// Create a new Device from components.
    ///
    /// This validates the key size, parses VMP data (if present), and
    /// extracts the system id from the signed DRM certificate.
    pub fn new(
        device_type: DeviceType,
        security_level: u8,
        flags: u8,
        private_key: RsaPrivateKey,
        client_id: ClientIdentification,
    ) -> Result<Self> {
        if !(1..=3).contains(&security_level) {
            return Err(DeviceFormatError::BadSecurityLevel(security_level).into());
        }

        let bits = private_key.size() * 8;
        if bits != PRIVATE_KEY_BITS {
            return Err(DeviceFormatError::PrivateKey(format!(
                "expected a {}-bit key, got {} bits",
                PRIVATE_KEY_BITS, bits
            ))
            .into());
        }

        let vmp = match client_id.vmp_data.as_deref() {
            Some(data) if !data.is_empty() => Some(
                FileHashes::decode(data).map_err(|e| DeviceFormatError::Vmp(e.to_string()))?,
            ),
            _ => None,
        };

        let system_id = device_certificate(&client_id)?
            .system_id
            .ok_or_else(|| DeviceFormatError::ClientId("system id missing".to_string()))?;

        Ok(Self {
            device_type,
            security_level,
            flags,
            private_key,
            client_id,
            vmp,
            system_id,
            key_pair_matches: OnceLock::new(),
        })
    }

    /// Load a device from a packed file or a device directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match DeviceSource::detect(path)? {
            DeviceSource::Packed(file) => {
                debug!("Loading packed device from {}", file.display());
                Self::from_path(file)
            }
            DeviceSource::Directory(dir) => {
                debug!("Loading device directory {}", dir.display());
                Self::from_dir(dir)
            }
        }
    }

    /// Load a Device from a WVD file path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path).map_err(DeviceFormatError::from)?;
        Self::from_bytes(&data)
    }

    /// Load a Device from a directory of separate credential files.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let config_bytes = read_required(dir, CONFIG_FILE_NAME)?;
        let config: DirectoryConfig = serde_json::from_slice(&config_bytes)
            .map_err(|e| DeviceFormatError::Config(e.to_string()))?;
        let device_type: DeviceType = config.session_id_type.parse()?;
        let flags = match config.send_key_control_nonce {
            Some(true) => FLAG_SEND_KEY_CONTROL_NONCE,
            Some(false) => 0,
            None => device_type.default_flags(),
        };

        let private_key = parse_private_key(&read_required(dir, PRIVATE_KEY_FILE_NAME)?)?;

        let mut client_id =
            ClientIdentification::decode(read_required(dir, CLIENT_ID_FILE_NAME)?.as_slice())
                .map_err(|e| DeviceFormatError::ClientId(e.to_string()))?;

        match std::fs::read(dir.join(VMP_FILE_NAME)) {
            Ok(vmp) => merge_vmp(&mut client_id, vmp),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DeviceFormatError::Io(e).into()),
        }

        Self::new(
            device_type,
            config.security_level,
            flags,
            private_key,
            client_id,
        )
    }

    /// Load a Device from WVD bytes (v1 or v2).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);

        if reader.take(3, "magic")? != WVD_MAGIC {
            return Err(DeviceFormatError::BadMagic.into());
        }
        let version = reader.u8("version")?;
        if version != 1 && version != WVD_VERSION {
            return Err(DeviceFormatError::UnsupportedVersion(version).into());
        }

        let device_type = DeviceType::try_from(reader.u8("device type")?)?;
        let security_level = reader.u8("security level")?;
        let flags = reader.u8("flags")?;

        let private_key = parse_private_key(reader.prefixed("private key")?)?;
        let mut client_id = ClientIdentification::decode(reader.prefixed("client id")?)
            .map_err(|e| DeviceFormatError::ClientId(e.to_string()))?;

        // v1 files may end right after the client id.
        if version == 1 && !reader.is_empty() {
            let vmp = reader.prefixed("VMP")?;
            if !vmp.is_empty() {
                merge_vmp(&mut client_id, vmp.to_vec());
            }
        }

        Self::new(device_type, security_level, flags, private_key, client_id)
    }

    /// Serialize the Device to WVD v2 bytes.
    ///
    /// VMP data travels inside the ClientIdentification.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let private_key_der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| DeviceFormatError::PrivateKey(e.to_string()))?;
        let private_key_bytes = private_key_der.as_bytes();
        let client_id_bytes = self.client_id.encode_to_vec();

        let mut buf = Vec::with_capacity(11 + private_key_bytes.len() + client_id_bytes.len());
        buf.extend_from_slice(WVD_MAGIC);
        buf.push(WVD_VERSION);
        buf.push(self.device_type.into());
        buf.push(self.security_level);
        buf.push(self.flags);
        write_prefixed(&mut buf, private_key_bytes)?;
        write_prefixed(&mut buf, &client_id_bytes)?;
        Ok(buf)
    }

    /// Save the Device to a WVD file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = self.to_bytes()?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Whether license requests carry a key control nonce.
    pub fn send_key_control_nonce(&self) -> bool {
        self.flags & FLAG_SEND_KEY_CONTROL_NONCE != 0
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    /// Check that the private key belongs to the certificate in the client id.
    ///
    /// Computed once per device.
    pub fn verify_key_pair(&self) -> Result<()> {
        let matches = *self.key_pair_matches.get_or_init(|| {
            let certified = device_certificate(&self.client_id)
                .ok()
                .and_then(|cert| cert.public_key)
                .and_then(|der| RsaPublicKey::from_pkcs1_der(&der).ok());
            certified.is_some_and(|key| key == self.public_key())
        });
        if matches {
            Ok(())
        } else {
            Err(Error::DeviceKeyMismatch)
        }
    }
}

fn device_certificate(
    client_id: &ClientIdentification,
) -> std::result::Result<DrmCertificate, DeviceFormatError> {
    let token = client_id
        .token
        .as_deref()
        .ok_or_else(|| DeviceFormatError::ClientId("token missing".to_string()))?;
    let signed = SignedDrmCertificate::decode(token)
        .map_err(|e| DeviceFormatError::ClientId(format!("SignedDrmCertificate: {}", e)))?;
    let cert_bytes = signed
        .drm_certificate
        .as_deref()
        .ok_or_else(|| DeviceFormatError::ClientId("DRM certificate missing".to_string()))?;
    DrmCertificate::decode(cert_bytes)
        .map_err(|e| DeviceFormatError::ClientId(format!("DrmCertificate: {}", e)))
}

fn merge_vmp(client_id: &mut ClientIdentification, vmp: Vec<u8>) {
    let has_vmp = client_id.vmp_data.as_ref().is_some_and(|d| !d.is_empty());
    if !has_vmp {
        client_id.vmp_data = Some(vmp);
    }
}

fn read_required(dir: &Path, name: &'static str) -> std::result::Result<Vec<u8>, DeviceFormatError> {
    std::fs::read(dir.join(name)).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DeviceFormatError::MissingFile(name),
        _ => DeviceFormatError::Io(e),
    })
}

/// Parse an RSA private key in PKCS#1 or PKCS#8, DER or PEM.
pub fn parse_private_key(data: &[u8]) -> std::result::Result<RsaPrivateKey, DeviceFormatError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(data) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(data) {
        return Ok(key);
    }
    if let Ok(pem) = std::str::from_utf8(data) {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            return Ok(key);
        }
    }
    Err(DeviceFormatError::PrivateKey(
        "not a PKCS#1 or PKCS#8 RSA key".to_string(),
    ))
}

fn write_prefixed(buf: &mut Vec<u8>, data: &[u8]) -> std::result::Result<(), DeviceFormatError> {
    let len = u16::try_from(data.len()).map_err(|_| DeviceFormatError::FieldTooLarge(data.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> std::result::Result<&'a [u8], DeviceFormatError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DeviceFormatError::Truncated(what))?;
        let out = &self.data[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    fn u8(&mut self, what: &'static str) -> std::result::Result<u8, DeviceFormatError> {
        Ok(self.take(1, what)?[0])
    }

    /// A u16 big-endian length followed by that many bytes.
    fn prefixed(&mut self, what: &'static str) -> std::result::Result<&'a [u8], DeviceFormatError> {
        let len = BigEndian::read_u16(self.take(2, what)?) as usize;
        self.take(len, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn wvd_roundtrip() {
        let device = testutil::device();
        let bytes = device.to_bytes().expect("serialize");
        assert_eq!(&bytes[..4], b"WVD\x02");

        let parsed = Device::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, device);
        assert_eq!(parsed.system_id, testutil::SYSTEM_ID);
    }

    #[test]
    fn v1_vmp_is_merged_into_client_id() {
        let device = testutil::device();
        let vmp = FileHashes {
            signer: Some(b"signer".to_vec()),
            signatures: Vec::new(),
        }
        .encode_to_vec();

        let v2 = device.to_bytes().expect("serialize");
        let mut v1 = v2.clone();
        v1[3] = 1;
        v1.extend_from_slice(&(vmp.len() as u16).to_be_bytes());
        v1.extend_from_slice(&vmp);

        let parsed = Device::from_bytes(&v1).expect("parse v1");
        assert_eq!(parsed.client_id.vmp_data.as_deref(), Some(vmp.as_slice()));
        assert!(parsed.vmp.is_some());
    }

    #[test]
    fn v1_without_vmp_length_loads() {
        let device = testutil::device();
        let mut v1 = device.to_bytes().expect("serialize");
        v1[3] = 1;

        let parsed = Device::from_bytes(&v1).expect("parse v1");
        assert_eq!(parsed, device);
        assert!(parsed.vmp.is_none());

        // A lone byte where the length should be is still truncation.
        v1.push(0);
        assert!(matches!(
            Device::from_bytes(&v1),
            Err(Error::InvalidDeviceFormat(DeviceFormatError::Truncated("VMP")))
        ));
    }

    #[test]
    fn nonce_flag_follows_bit_zero() {
        let mut bytes = testutil::device_of_type(DeviceType::Chrome)
            .to_bytes()
            .expect("serialize");
        assert!(!Device::from_bytes(&bytes).expect("parse").send_key_control_nonce());

        bytes[6] = 0b1000_0001;
        let parsed = Device::from_bytes(&bytes).expect("parse");
        assert!(parsed.send_key_control_nonce());
        assert_eq!(parsed.flags, 0b1000_0001);
        assert_eq!(parsed.to_bytes().expect("serialize")[6], 0b1000_0001);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = testutil::device().to_bytes().expect("serialize");
        bytes[3] = 9;
        assert!(matches!(
            Device::from_bytes(&bytes),
            Err(Error::InvalidDeviceFormat(DeviceFormatError::UnsupportedVersion(9)))
        ));

        bytes[0] = b'X';
        assert!(matches!(
            Device::from_bytes(&bytes),
            Err(Error::InvalidDeviceFormat(DeviceFormatError::BadMagic))
        ));
    }

    #[test]
    fn rejects_truncated_data() {
        let bytes = testutil::device().to_bytes().expect("serialize");
        for len in [0, 2, 6, 9, 100, bytes.len() - 1] {
            assert!(
                matches!(
                    Device::from_bytes(&bytes[..len]),
                    Err(Error::InvalidDeviceFormat(_))
                ),
                "len {}",
                len
            );
        }
    }

    #[test]
    fn rejects_bad_security_level() {
        let mut bytes = testutil::device().to_bytes().expect("serialize");
        bytes[5] = 4;
        assert!(matches!(
            Device::from_bytes(&bytes),
            Err(Error::InvalidDeviceFormat(DeviceFormatError::BadSecurityLevel(4)))
        ));
    }

    #[test]
    fn key_pair_check() {
        let device = testutil::device();
        device.verify_key_pair().expect("matching key pair");

        let mismatched = Device::new(
            DeviceType::Android,
            3,
            0,
            testutil::other_private_key(),
            device.client_id.clone(),
        )
        .expect("device");
        assert!(matches!(
            mismatched.verify_key_pair(),
            Err(Error::DeviceKeyMismatch)
        ));
    }

    #[test]
    fn private_key_formats() {
        let pem = include_str!("../tests/fixtures/device_private_key.pem");
        let der = include_bytes!("../tests/fixtures/device_private_key.der");
        let from_pem = parse_private_key(pem.as_bytes()).expect("pem");
        let from_der = parse_private_key(der).expect("der");
        assert_eq!(from_pem, from_der);

        assert!(parse_private_key(b"garbage").is_err());
    }

    #[test]
    fn device_type_names() {
        assert_eq!("Android".parse::<DeviceType>().expect("type"), DeviceType::Android);
        assert_eq!("chrome".parse::<DeviceType>().expect("type"), DeviceType::Chrome);
        assert!("tv".parse::<DeviceType>().is_err());
    }
}
