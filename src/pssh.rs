//! Protection header (PSSH) parsing.
//!
//! Accepts a full `pssh` box (v0 or v1), a run of concatenated boxes, or
//! bare Widevine PSSH data. Only Widevine headers are accepted.
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::license_protocol::WidevinePsshData;

/// Widevine system UUID.
pub const WIDEVINE_SYSTEM_ID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

/// size (4) + type (4) + version/flags (4) + system id (16) + data size (4)
const MIN_BOX_SIZE: usize = 32;

const SCHEME_CENC: u32 = u32::from_be_bytes(*b"cenc");
const SCHEME_CBC1: u32 = u32::from_be_bytes(*b"cbc1");
const SCHEME_CENS: u32 = u32::from_be_bytes(*b"cens");
const SCHEME_CBCS: u32 = u32::from_be_bytes(*b"cbcs");

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedProtectionHeader(msg.into())
}

/// Content encryption scheme announced by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Unencrypted,
    /// AES-CTR, full sample.
    Cenc,
    /// AES-CBC, full sample.
    Cbc1,
    /// AES-CTR, pattern.
    Cens,
    /// AES-CBC, pattern.
    Cbcs,
    Unknown(u32),
}

impl Algorithm {
    fn from_pssh_data(data: &WidevinePsshData) -> Self {
        if let Some(scheme) = data.protection_scheme {
            return match scheme {
                SCHEME_CENC => Algorithm::Cenc,
                SCHEME_CBC1 => Algorithm::Cbc1,
                SCHEME_CENS => Algorithm::Cens,
                SCHEME_CBCS => Algorithm::Cbcs,
                other => Algorithm::Unknown(other),
            };
        }
        match data.algorithm {
            Some(0) => Algorithm::Unencrypted,
            Some(1) | None => Algorithm::Cenc,
            Some(other) => Algorithm::Unknown(other as u32),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Unencrypted => f.write_str("unencrypted"),
            Algorithm::Cenc => f.write_str("cenc"),
            Algorithm::Cbc1 => f.write_str("cbc1"),
            Algorithm::Cens => f.write_str("cens"),
            Algorithm::Cbcs => f.write_str("cbcs"),
            Algorithm::Unknown(value) => write!(f, "unknown({:#010x})", value),
        }
    }
}

/// What a protection header says about the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionHeader {
    pub algorithm: Algorithm,
    pub key_ids: Vec<Uuid>,
    pub content_id: Option<Vec<u8>>,
    pub provider: Option<String>,
}

/// A validated Widevine PSSH box.
#[derive(Debug, Clone)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    box_key_ids: Vec<Uuid>,
    /// Widevine PSSH data, forwarded verbatim in license requests.
    pub init_data: Vec<u8>,
    header: ProtectionHeader,
}

impl Pssh {
    /// Parse a PSSH box, a run of boxes, or bare Widevine PSSH data.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(malformed("data must not be empty"));
        }

        if data.len() >= 8 && &data[4..8] == b"pssh" {
            return parse_pssh_boxes(data);
        }

        Pssh::new(WIDEVINE_SYSTEM_ID, Vec::new(), data.to_vec(), 0, 0)
    }

    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data_b64.trim())
            .map_err(|e| malformed(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&data)
    }

    /// Build a header from its parts.
    ///
    /// `key_ids` are only written to the box for version 1.
    pub fn new(
        system_id: Uuid,
        key_ids: Vec<Uuid>,
        init_data: Vec<u8>,
        version: u8,
        flags: u32,
    ) -> Result<Self> {
        if version > 1 {
            return Err(malformed(format!("unsupported PSSH box version {}", version)));
        }
        if system_id != WIDEVINE_SYSTEM_ID {
            return Err(malformed(format!("unsupported system id {}", system_id)));
        }
        if version == 0 && !key_ids.is_empty() {
            return Err(malformed("version 0 PSSH boxes cannot carry key ids"));
        }

        let data = WidevinePsshData::decode(init_data.as_slice())
            .map_err(|e| malformed(format!("failed to parse Widevine PSSH data: {}", e)))?;

        let header_key_ids = if !key_ids.is_empty() {
            key_ids.clone()
        } else {
            data.key_ids
                .iter()
                .map(|kid| parse_key_id(kid))
                .collect::<Result<Vec<_>>>()?
        };

        let header = ProtectionHeader {
            algorithm: Algorithm::from_pssh_data(&data),
            key_ids: header_key_ids,
            content_id: data.content_id.clone(),
            provider: data.provider.clone(),
        };

        Ok(Self {
            version,
            flags,
            system_id,
            box_key_ids: key_ids,
            init_data,
            header,
        })
    }

    /// A version 0 header listing `key_ids`.
    pub fn from_key_ids(key_ids: &[Uuid]) -> Result<Self> {
        let data = WidevinePsshData {
            key_ids: key_ids.iter().map(|id| id.as_bytes().to_vec()).collect(),
            ..Default::default()
        };
        Self::new(WIDEVINE_SYSTEM_ID, Vec::new(), data.encode_to_vec(), 0, 0)
    }

    pub fn header(&self) -> &ProtectionHeader {
        &self.header
    }

    /// Key ids, from the v1 box when present, else from the PSSH data.
    pub fn key_ids(&self) -> &[Uuid] {
        &self.header.key_ids
    }

    pub fn content_id(&self) -> Option<&[u8]> {
        self.header.content_id.as_deref()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.header.algorithm
    }

    /// Serialize as a full PSSH box.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&self.flags.to_be_bytes()[1..]);
        body.extend_from_slice(self.system_id.as_bytes());

        if self.version == 1 {
            body.extend_from_slice(&(self.box_key_ids.len() as u32).to_be_bytes());
            for kid in self.box_key_ids.iter() {
                body.extend_from_slice(kid.as_bytes());
            }
        }

        body.extend_from_slice(&(self.init_data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.init_data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(b"pssh");
        out.extend_from_slice(&body);
        out
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }
}

impl FromStr for Pssh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pssh::from_base64(s)
    }
}

/// Walk concatenated boxes and return the first Widevine one.
fn parse_pssh_boxes(data: &[u8]) -> Result<Pssh> {
    let mut offset = 0;
    let mut last_system_id = None;

    while offset < data.len() {
        let (raw, size) = parse_pssh_box(&data[offset..])?;
        if raw.system_id == WIDEVINE_SYSTEM_ID {
            return Pssh::new(
                raw.system_id,
                raw.key_ids,
                raw.init_data,
                raw.version,
                raw.flags,
            );
        }
        last_system_id = Some(raw.system_id);
        offset += size;
    }

    Err(malformed(match last_system_id {
        Some(id) => format!("unsupported system id {}", id),
        None => "no PSSH box found".to_string(),
    }))
}

struct RawBox {
    version: u8,
    flags: u32,
    system_id: Uuid,
    key_ids: Vec<Uuid>,
    init_data: Vec<u8>,
}

/// Parse one box at the start of `data`, returning it and its size.
fn parse_pssh_box(data: &[u8]) -> Result<(RawBox, usize)> {
    if data.len() < MIN_BOX_SIZE {
        return Err(malformed(format!(
            "PSSH box is {} bytes, shorter than the {} byte minimum",
            data.len(),
            MIN_BOX_SIZE
        )));
    }

    let mut offset = 0;
    let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if &data[offset..offset + 4] != b"pssh" {
        return Err(malformed("not a PSSH box"));
    }
    offset += 4;

    let box_size = match size {
        0 => data.len(),
        1 => {
            let large = BigEndian::read_u64(&data[offset..offset + 8]);
            offset += 8;
            usize::try_from(large).map_err(|_| malformed("PSSH box size overflows"))?
        }
        n => n,
    };
    if box_size > data.len() {
        return Err(malformed("PSSH box size exceeds data length"));
    }
    if box_size < offset + MIN_BOX_SIZE - 8 {
        return Err(malformed("PSSH box size is smaller than its header"));
    }
    let data = &data[..box_size];

    let version = data[offset];
    if version > 1 {
        return Err(malformed(format!("unsupported PSSH box version {}", version)));
    }
    let flags = BigEndian::read_u32(&data[offset..offset + 4]) & 0x00FF_FFFF;
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| malformed("invalid system id"))?;
    offset += 16;

    let mut key_ids = Vec::new();
    if version == 1 {
        if data.len() < offset + 4 {
            return Err(malformed("missing KID count"));
        }
        let kid_count = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;

        let end = kid_count
            .checked_mul(16)
            .and_then(|n| n.checked_add(offset))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| malformed("KID list exceeds box size"))?;
        for chunk in data[offset..end].chunks_exact(16) {
            key_ids.push(Uuid::from_slice(chunk).map_err(|_| malformed("invalid KID"))?);
        }
        offset = end;
    }

    if data.len() < offset + 4 {
        return Err(malformed("missing init data length"));
    }
    let data_size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if data.len() - offset < data_size {
        return Err(malformed("init data exceeds box size"));
    }
    let init_data = data[offset..offset + data_size].to_vec();

    Ok((
        RawBox {
            version,
            flags,
            system_id,
            key_ids,
            init_data,
        },
        box_size,
    ))
}

/// Parse a 16-byte key id, or its 32 character hex form.
pub fn parse_key_id(key_id: &[u8]) -> Result<Uuid> {
    match key_id.len() {
        16 => Uuid::from_slice(key_id).map_err(|_| malformed("invalid key id")),
        32 => std::str::from_utf8(key_id)
            .ok()
            .and_then(|s| Uuid::try_parse(s).ok())
            .ok_or_else(|| malformed("32 byte key id is not hex")),
        n => Err(malformed(format!("key id must be 16 bytes, got {}", n))),
    }
}
