//! Key cache.
//!
//! Content keys from verified licenses can be stored under a digest of the
//! protection header and looked up before contacting a license server.
//! The cache is an optimization: callers treat its errors as misses.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::key::{Key, KeyType, OutputRestrictions};
use crate::pssh::ProtectionHeader;

/// Table: content_keys
/// Key: cache key (hex SHA-256)
/// Value: JSON-encoded CacheEntry
const CONTENT_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("content_keys");

/// Errors from a key cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),
    #[error("cache serialization error: {0}")]
    Serialization(String),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Identifies the content a set of keys belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Digest of the content id when present, else of the sorted key ids.
    ///
    /// `None` when the header identifies nothing.
    pub fn for_header(header: &ProtectionHeader) -> Option<Self> {
        let mut hasher = Sha256::new();
        if let Some(content_id) = header.content_id.as_deref().filter(|c| !c.is_empty()) {
            hasher.update(b"content_id:");
            hasher.update(content_id);
        } else if !header.key_ids.is_empty() {
            let mut kids = header.key_ids.clone();
            kids.sort_unstable();
            kids.dedup();
            hasher.update(b"key_ids:");
            for kid in kids {
                hasher.update(kid.as_bytes());
            }
        } else {
            return None;
        }
        Some(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored form of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedKey {
    pub kid: String,
    pub key_type: String,
    pub key: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub disable_analog_output: bool,
    #[serde(default)]
    pub disable_digital_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdcp: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgms_flags: Option<i32>,
}

impl From<&Key> for CachedKey {
    fn from(key: &Key) -> Self {
        Self {
            kid: key.kid.simple().to_string(),
            key_type: key.key_type.as_str_name().to_string(),
            key: key.key_hex().to_string(),
            permissions: key.permissions.clone(),
            disable_analog_output: key.output.disable_analog_output,
            disable_digital_output: key.output.disable_digital_output,
            hdcp: key.output.hdcp,
            cgms_flags: key.output.cgms_flags,
        }
    }
}

impl TryFrom<&CachedKey> for Key {
    type Error = CacheError;

    fn try_from(cached: &CachedKey) -> Result<Self, Self::Error> {
        let kid = Uuid::try_parse(&cached.kid)
            .map_err(|e| CacheError::Corrupt(format!("kid: {}", e)))?;
        let key_type = KeyType::from_str_name(&cached.key_type)
            .ok_or_else(|| CacheError::Corrupt(format!("key type {}", cached.key_type)))?;
        let bytes = hex::decode(&cached.key).map_err(|e| CacheError::Corrupt(format!("key: {}", e)))?;

        let mut key = Key::new(key_type, kid, bytes);
        key.permissions = cached.permissions.clone();
        key.output = OutputRestrictions {
            disable_analog_output: cached.disable_analog_output,
            disable_digital_output: cached.disable_digital_output,
            hdcp: cached.hdcp,
            cgms_flags: cached.cgms_flags,
        };
        Ok(key)
    }
}

/// Keys stored for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub keys: Vec<CachedKey>,
    /// Unix timestamp (seconds) of the store.
    pub inserted_at: u64,
}

impl CacheEntry {
    fn new(keys: &[Key]) -> Self {
        Self {
            keys: keys.iter().map(CachedKey::from).collect(),
            inserted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    fn to_keys(&self) -> Result<Vec<Key>, CacheError> {
        self.keys.iter().map(Key::try_from).collect()
    }
}

/// A store of content keys.
///
/// Implementations must be safe to share across sessions. Stores are
/// whole-entry replacements, so a concurrent reader sees either the old or
/// the new key set, never a mix.
pub trait KeyCache: Send + Sync {
    /// Keys stored for `key`, or `None`.
    fn lookup(&self, key: &CacheKey) -> Result<Option<Vec<Key>>, CacheError>;

    /// Replace the keys stored for `key`.
    fn store(&self, key: &CacheKey, keys: &[Key]) -> Result<(), CacheError>;
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryKeyCache {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyCache for MemoryKeyCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<Vec<Key>>, CacheError> {
        let entry = self.entries.read().get(key).cloned();
        entry.map(|entry| entry.to_keys()).transpose()
    }

    fn store(&self, key: &CacheKey, keys: &[Key]) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::new(keys));
        self.entries.write().insert(key.clone(), entry);
        Ok(())
    }
}

/// Durable cache backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbKeyCache {
    db: Arc<Database>,
}

impl fmt::Debug for RedbKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbKeyCache").finish_non_exhaustive()
    }
}

impl RedbKeyCache {
    /// Open or create a cache database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = Database::create(path.as_ref()).map_err(|e| CacheError::Storage(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| CacheError::Storage(e.to_string()))?;
        {
            let _ = txn
                .open_table(CONTENT_KEYS)
                .map_err(|e| CacheError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| CacheError::Storage(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Raw entry, including its timestamp.
    pub fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let txn = self.db.begin_read().map_err(|e| CacheError::Storage(e.to_string()))?;
        let table = txn
            .open_table(CONTENT_KEYS)
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        let Some(value) = table
            .get(key.as_str())
            .map_err(|e| CacheError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(value.value())
            .map(Some)
            .map_err(|e| CacheError::Corrupt(e.to_string()))
    }
}

impl KeyCache for RedbKeyCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<Vec<Key>>, CacheError> {
        self.entry(key)?.map(|entry| entry.to_keys()).transpose()
    }

    fn store(&self, key: &CacheKey, keys: &[Key]) -> Result<(), CacheError> {
        let value = serde_json::to_vec(&CacheEntry::new(keys))
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let txn = self.db.begin_write().map_err(|e| CacheError::Storage(e.to_string()))?;
        {
            let mut table = txn
                .open_table(CONTENT_KEYS)
                .map_err(|e| CacheError::Storage(e.to_string()))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| CacheError::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| CacheError::Storage(e.to_string()))?;
        Ok(())
    }
}
