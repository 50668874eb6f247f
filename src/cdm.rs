//! Session manager.
//!
//! [`Cdm`] owns the device, a table of open sessions, and an optional key
//! cache. Sessions are independent: each one is locked on its own, and the
//! table lock is only held to insert, look up, or remove an entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::certificate::ServiceCertificate;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::key::{Key, KeyCoverage, KeyType};
use crate::license_protocol::LicenseType;
use crate::pssh::{ProtectionHeader, Pssh};
use crate::session::Session;
use crate::vault::{CacheKey, KeyCache};

/// Widevine Content Decryption Module (CDM).
pub struct Cdm {
    device: Arc<Device>,
    cache: Option<Arc<dyn KeyCache>>,
    sessions: Mutex<HashMap<Vec<u8>, Arc<Session>>>,
    session_counter: AtomicU32,
}

impl std::fmt::Debug for Cdm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cdm")
            .field("device", &self.device)
            .field("cache", &self.cache.is_some())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Cdm {
    /// Maximum number of concurrent sessions.
    pub const MAX_NUM_OF_SESSIONS: usize = 16;

    pub fn new(device: Device) -> Self {
        Self::from_shared(Arc::new(device))
    }

    pub fn from_shared(device: Arc<Device>) -> Self {
        Self {
            device,
            cache: None,
            sessions: Mutex::new(HashMap::new()),
            session_counter: AtomicU32::new(0),
        }
    }

    /// Attach a key cache. Keys of verified licenses are stored in it.
    pub fn with_cache(mut self, cache: Arc<dyn KeyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Open a session for `pssh`.
    ///
    /// A service certificate turns on privacy mode for this session.
    pub fn open(
        &self,
        pssh: &Pssh,
        service_certificate: Option<ServiceCertificate>,
        license_type: LicenseType,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= Self::MAX_NUM_OF_SESSIONS {
            return Err(Error::TooManySessions {
                max: Self::MAX_NUM_OF_SESSIONS,
            });
        }

        let number = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::open(
            number,
            Arc::clone(&self.device),
            pssh.clone(),
            service_certificate,
            license_type,
        ));
        sessions.insert(session.id().to_vec(), Arc::clone(&session));
        debug!(
            "Opened session {} ({} of {})",
            number,
            sessions.len(),
            Self::MAX_NUM_OF_SESSIONS
        );
        Ok(session)
    }

    /// Look up an open session.
    pub fn session(&self, session_id: &[u8]) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::InvalidSession(session_id.to_vec()))
    }

    /// Build the license challenge of a session.
    pub fn get_license_challenge(&self, session_id: &[u8]) -> Result<Vec<u8>> {
        self.session(session_id)?.build_challenge()
    }

    /// Verify a license response and return its keys.
    ///
    /// Content keys are written to the cache when one is attached. A license
    /// that omits requested key ids still succeeds; the gap is logged.
    pub fn parse_license(&self, session_id: &[u8], license: &[u8]) -> Result<Vec<Key>> {
        let session = self.session(session_id)?;
        let keys = session.process_response(license)?;

        let header = session.header();
        let coverage = KeyCoverage::of(&header.key_ids, &keys);
        if !coverage.is_complete() {
            warn!(
                "License for session {} is missing {} of {} requested keys: {:?}",
                session.number(),
                coverage.missing.len(),
                header.key_ids.len(),
                coverage.missing
            );
        }
        if !coverage.extra.is_empty() {
            debug!(
                "License for session {} carries {} unrequested keys",
                session.number(),
                coverage.extra.len()
            );
        }

        self.store_keys(header, &keys);
        Ok(keys)
    }

    fn store_keys(&self, header: &ProtectionHeader, keys: &[Key]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let content_keys = keys
            .iter()
            .filter(|k| k.key_type == KeyType::Content)
            .cloned()
            .collect::<Vec<_>>();
        if content_keys.is_empty() {
            return;
        }
        let Some(cache_key) = CacheKey::for_header(header) else {
            return;
        };
        if let Err(e) = cache.store(&cache_key, &content_keys) {
            warn!("Failed to cache keys under {}: {}", cache_key, e);
        }
    }

    /// Cached content keys for `pssh`.
    ///
    /// Returns `None` on a miss, when no cache is attached, when the cache
    /// fails, or when the cached set does not cover every requested key id.
    pub fn cached_keys(&self, pssh: &Pssh) -> Option<Vec<Key>> {
        let cache = self.cache.as_ref()?;
        let cache_key = CacheKey::for_header(pssh.header())?;
        let keys = match cache.lookup(&cache_key) {
            Ok(keys) => keys?,
            Err(e) => {
                warn!("Key cache lookup failed for {}: {}", cache_key, e);
                return None;
            }
        };
        if KeyCoverage::of(pssh.key_ids(), &keys).is_complete() {
            trace!("Key cache hit for {}", cache_key);
            Some(keys)
        } else {
            None
        }
    }

    /// Keys of a verified session, optionally filtered by type.
    pub fn get_keys(&self, session_id: &[u8], key_type: Option<KeyType>) -> Result<Vec<Key>> {
        let keys = self.session(session_id)?.keys()?;
        Ok(match key_type {
            Some(key_type) => keys.into_iter().filter(|k| k.key_type == key_type).collect(),
            None => keys,
        })
    }

    /// Close a session and wipe its key material.
    pub fn close(&self, session_id: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| Error::InvalidSession(session_id.to_vec()))?;
        session.close();
        debug!("Closed session {}", session.number());
        Ok(())
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
