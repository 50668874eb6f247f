//! Fuzz target for protection header parsing.
//!
//! # Invariants
//!
//! - Parsing never panics, whatever the claimed box or key id sizes
//! - Every failure is a MalformedProtectionHeader
//! - A parsed header serializes to a box that parses to the same key ids

#![no_main]

use libfuzzer_sys::fuzz_target;
use vinecdm::pssh::Pssh;
use vinecdm::Error;

fuzz_target!(|data: &[u8]| {
    match Pssh::from_bytes(data) {
        Ok(pssh) => {
            let reparsed = Pssh::from_bytes(&pssh.to_bytes()).expect("serialized box must parse");
            assert_eq!(reparsed.key_ids(), pssh.key_ids());
            assert_eq!(reparsed.init_data, pssh.init_data);
        }
        Err(Error::MalformedProtectionHeader(_)) => {}
        Err(e) => panic!("unexpected error kind: {e}"),
    }
});
