//! Fuzz target for license response decoding.
//!
//! The first byte picks how much of the input is treated as the expected
//! request id; the rest is the response.
//!
//! # Invariants
//!
//! - Decoding never panics on malformed protobuf
//! - Failures are InvalidLicenseMessage or ResponseBindingMismatch
//! - A decoded response always echoes the expected request id

#![no_main]

use libfuzzer_sys::fuzz_target;
use vinecdm::codec;
use vinecdm::Error;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = usize::from(split % 33).min(rest.len());
    let (request_id, response) = rest.split_at(split);

    match codec::decode_license_response(response, request_id) {
        Ok(decoded) => {
            let echoed = decoded
                .license
                .id
                .as_ref()
                .and_then(|id| id.request_id.as_deref());
            assert_eq!(echoed, Some(request_id));
        }
        Err(Error::InvalidLicenseMessage(_) | Error::ResponseBindingMismatch(_)) => {}
        Err(e) => panic!("unexpected error kind: {e}"),
    }

    let _ = codec::decode_service_certificate(data);
});
