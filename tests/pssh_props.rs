//! Property tests for protection header parsing.
//!
//! Arbitrary input must never panic, and headers built from key ids must
//! survive serialization.

use proptest::prelude::*;
use uuid::Uuid;

use vinecdm::pssh::{Pssh, WIDEVINE_SYSTEM_ID};
use vinecdm::Error;

fn uuid_strategy() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// A box header claiming `size` bytes, followed by arbitrary bytes.
fn box_like() -> impl Strategy<Value = Vec<u8>> {
    (any::<u32>(), prop::collection::vec(any::<u8>(), 0..96)).prop_map(|(size, rest)| {
        let mut data = size.to_be_bytes().to_vec();
        data.extend_from_slice(b"pssh");
        data.extend_from_slice(&rest);
        data
    })
}

proptest! {
    /// Arbitrary bytes either parse or fail with MalformedProtectionHeader.
    #[test]
    fn parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Err(e) = Pssh::from_bytes(&data) {
            prop_assert!(matches!(e, Error::MalformedProtectionHeader(_)));
        }
    }

    /// Inputs that look like boxes exercise the size and key id checks.
    #[test]
    fn box_like_input_never_panics(data in box_like()) {
        if let Err(e) = Pssh::from_bytes(&data) {
            prop_assert!(matches!(e, Error::MalformedProtectionHeader(_)));
        }
    }

    #[test]
    fn base64_input_never_panics(text in "[A-Za-z0-9+/=]{0,128}") {
        let _ = Pssh::from_base64(&text);
    }

    /// Key ids listed in the PSSH data survive a trip through a v0 box.
    #[test]
    fn key_ids_survive_v0_box(kids in prop::collection::vec(uuid_strategy(), 0..8)) {
        let pssh = Pssh::from_key_ids(&kids).expect("pssh");
        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse");
        prop_assert_eq!(parsed.key_ids(), &kids[..]);
        prop_assert_eq!(parsed.version, 0);
        prop_assert_eq!(parsed.to_base64(), pssh.to_base64());
    }

    /// Key ids in a v1 box header take precedence over the PSSH data.
    #[test]
    fn key_ids_survive_v1_box(
        box_kids in prop::collection::vec(uuid_strategy(), 1..8),
        data_kids in prop::collection::vec(uuid_strategy(), 0..4),
    ) {
        let init_data = Pssh::from_key_ids(&data_kids).expect("pssh").init_data;
        let pssh = Pssh::new(WIDEVINE_SYSTEM_ID, box_kids.clone(), init_data, 1, 0).expect("v1");
        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse");
        prop_assert_eq!(parsed.version, 1);
        prop_assert_eq!(parsed.key_ids(), &box_kids[..]);
    }
}
