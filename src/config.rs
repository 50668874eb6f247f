//! YAML configuration.
//!
//! ```yaml
//! device: devices/pixel.wvd      # packed file or device directory
//! cache: keys.redb               # optional durable key cache
//! license_type: STREAMING
//! privacy_mode: true
//! service_certificate: common    # common, staging, or base64
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cdm::Cdm;
use crate::certificate::ServiceCertificate;
use crate::codec;
use crate::device::Device;
use crate::error::Result;
use crate::license_protocol::LicenseType;
use crate::vault::RedbKeyCache;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn default_license_type() -> String {
    LicenseType::Streaming.as_str_name().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub device: PathBuf,
    #[serde(default)]
    pub cache: Option<PathBuf>,
    #[serde(default = "default_license_type")]
    pub license_type: String,
    #[serde(default)]
    pub privacy_mode: bool,
    #[serde(default)]
    pub service_certificate: Option<String>,
}

impl Config {
    /// A config naming only a device; everything else is default.
    pub fn for_device(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            cache: None,
            license_type: default_license_type(),
            privacy_mode: false,
            service_certificate: None,
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_yaml_str(&std::fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            config.device = base.join(&config.device);
            config.cache = config.cache.map(|cache| base.join(cache));
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn license_type(&self) -> Result<LicenseType> {
        codec::parse_license_type(&self.license_type)
    }

    /// The configured service certificate, verified.
    ///
    /// `common` and `staging` name the compiled-in certificates.
    pub fn service_certificate(&self) -> Result<Option<ServiceCertificate>> {
        match self.service_certificate.as_deref() {
            None => Ok(None),
            Some("common") => ServiceCertificate::common().map(Some),
            Some("staging") => ServiceCertificate::staging().map(Some),
            Some(b64) => ServiceCertificate::from_base64(b64).map(Some),
        }
    }

    /// Load the device and open the cache.
    ///
    /// A cache that fails to open is skipped with a warning.
    pub fn build_cdm(&self) -> Result<Cdm> {
        let cdm = Cdm::new(Device::load(&self.device)?);
        let Some(path) = self.cache.as_ref() else {
            return Ok(cdm);
        };
        match RedbKeyCache::open(path) {
            Ok(cache) => Ok(cdm.with_cache(Arc::new(cache))),
            Err(e) => {
                warn!("Key cache at {} unavailable: {}", path.display(), e);
                Ok(cdm)
            }
        }
    }
}
