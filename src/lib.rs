//! vinecdm - a Widevine-style Content Decryption Module.
//!
//! This crate provides:
//! - Device credential loading, from packed `.wvd` files or device directories.
//! - Protection header (PSSH) parsing.
//! - License request signing and license response verification.
//! - Session management with per-session nonces.
//! - An optional content key cache (in memory or Redb).
//!
//! Feature flags:
//! - `cli`: build the `vinecdm` binary.
//! - `tracing`: emit log events through `tracing`.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Session manager.
pub mod cdm;
/// Service certificates and the root trust anchor.
pub mod certificate;
/// License protocol codec.
pub mod codec;
/// YAML configuration.
pub mod config;
/// Key derivation and verification engine.
pub mod crypto;
/// Device credentials.
pub mod device;
/// Common error types and Result alias.
pub mod error;
/// Decrypted key representation.
pub mod key;
/// License protocol messages.
pub mod license_protocol;
/// Protection header parsing.
pub mod pssh;
/// License sessions.
pub mod session;
/// Content key cache.
pub mod vault;

#[cfg(test)]
mod testutil;

pub use cdm::Cdm;
pub use device::Device;
pub use error::{Error, Result};
pub use key::Key;
pub use pssh::Pssh;
