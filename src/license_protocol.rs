//! Protobuf definitions for the license protocol.
//!
//! These are maintained by hand in the shape prost-build emits, covering the
//! subset of `license_protocol.proto` this crate reads and writes. Fields
//! that are not listed here are skipped on decode, so newer servers can add
//! fields without breaking parsing.
#![allow(clippy::derive_partial_eq_without_eq)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LicenseType {
    Streaming = 1,
    Offline = 2,
    /// License type decision is left to the provider.
    Automatic = 3,
}

impl LicenseType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            LicenseType::Streaming => "STREAMING",
            LicenseType::Offline => "OFFLINE",
            LicenseType::Automatic => "AUTOMATIC",
        }
    }

    pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
        match value {
            "STREAMING" => Some(Self::Streaming),
            "OFFLINE" => Some(Self::Offline),
            "AUTOMATIC" => Some(Self::Automatic),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Version20 = 20,
    Version21 = 21,
    Version22 = 22,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseIdentification {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub request_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub session_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub purchase_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "LicenseType", optional, tag = "4")]
    pub r#type: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub version: ::core::option::Option<i32>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub provider_session_token: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct License {
    #[prost(message, optional, tag = "1")]
    pub id: ::core::option::Option<LicenseIdentification>,
    #[prost(message, optional, tag = "2")]
    pub policy: ::core::option::Option<license::Policy>,
    #[prost(message, repeated, tag = "3")]
    pub key: ::prost::alloc::vec::Vec<license::KeyContainer>,
    #[prost(int64, optional, tag = "4")]
    pub license_start_time: ::core::option::Option<i64>,
    #[prost(bool, optional, tag = "5")]
    pub remote_attestation_verified: ::core::option::Option<bool>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub provider_client_token: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint32, optional, tag = "7")]
    pub protection_scheme: ::core::option::Option<u32>,
}

/// Nested message and enum types in `License`.
pub mod license {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Policy {
        #[prost(bool, optional, tag = "1")]
        pub can_play: ::core::option::Option<bool>,
        #[prost(bool, optional, tag = "2")]
        pub can_persist: ::core::option::Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub can_renew: ::core::option::Option<bool>,
        #[prost(int64, optional, tag = "4")]
        pub rental_duration_seconds: ::core::option::Option<i64>,
        #[prost(int64, optional, tag = "5")]
        pub playback_duration_seconds: ::core::option::Option<i64>,
        #[prost(int64, optional, tag = "6")]
        pub license_duration_seconds: ::core::option::Option<i64>,
        #[prost(string, optional, tag = "8")]
        pub renewal_server_url: ::core::option::Option<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyContainer {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub iv: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        #[prost(enumeration = "key_container::KeyType", optional, tag = "4")]
        pub r#type: ::core::option::Option<i32>,
        #[prost(enumeration = "key_container::SecurityLevel", optional, tag = "5")]
        pub level: ::core::option::Option<i32>,
        #[prost(message, optional, tag = "6")]
        pub required_protection: ::core::option::Option<key_container::OutputProtection>,
        #[prost(message, optional, tag = "7")]
        pub requested_protection: ::core::option::Option<key_container::OutputProtection>,
        #[prost(message, optional, tag = "8")]
        pub key_control: ::core::option::Option<key_container::KeyControl>,
        #[prost(message, optional, tag = "9")]
        pub operator_session_key_permissions:
            ::core::option::Option<key_container::OperatorSessionKeyPermissions>,
        #[prost(string, optional, tag = "12")]
        pub track_label: ::core::option::Option<::prost::alloc::string::String>,
    }

    /// Nested message and enum types in `KeyContainer`.
    pub mod key_container {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct KeyControl {
            #[prost(bytes = "vec", optional, tag = "1")]
            pub key_control_block: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
            #[prost(bytes = "vec", optional, tag = "2")]
            pub iv: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct OutputProtection {
            #[prost(int32, optional, tag = "1")]
            pub hdcp: ::core::option::Option<i32>,
            #[prost(int32, optional, tag = "2")]
            pub cgms_flags: ::core::option::Option<i32>,
            #[prost(bool, optional, tag = "4")]
            pub disable_analog_output: ::core::option::Option<bool>,
            #[prost(bool, optional, tag = "5")]
            pub disable_digital_output: ::core::option::Option<bool>,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct OperatorSessionKeyPermissions {
            #[prost(bool, optional, tag = "1")]
            pub allow_encrypt: ::core::option::Option<bool>,
            #[prost(bool, optional, tag = "2")]
            pub allow_decrypt: ::core::option::Option<bool>,
            #[prost(bool, optional, tag = "3")]
            pub allow_sign: ::core::option::Option<bool>,
            #[prost(bool, optional, tag = "4")]
            pub allow_signature_verify: ::core::option::Option<bool>,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum KeyType {
            /// Exactly one key of this type must appear.
            Signing = 1,
            Content = 2,
            KeyControl = 3,
            OperatorSession = 4,
            Entitlement = 5,
            OemContent = 6,
        }

        impl KeyType {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    KeyType::Signing => "SIGNING",
                    KeyType::Content => "CONTENT",
                    KeyType::KeyControl => "KEY_CONTROL",
                    KeyType::OperatorSession => "OPERATOR_SESSION",
                    KeyType::Entitlement => "ENTITLEMENT",
                    KeyType::OemContent => "OEM_CONTENT",
                }
            }

            pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
                match value {
                    "SIGNING" => Some(Self::Signing),
                    "CONTENT" => Some(Self::Content),
                    "KEY_CONTROL" => Some(Self::KeyControl),
                    "OPERATOR_SESSION" => Some(Self::OperatorSession),
                    "ENTITLEMENT" => Some(Self::Entitlement),
                    "OEM_CONTENT" => Some(Self::OemContent),
                    _ => None,
                }
            }
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum SecurityLevel {
            SwSecureCrypto = 1,
            SwSecureDecode = 2,
            HwSecureCrypto = 3,
            HwSecureDecode = 4,
            HwSecureAll = 5,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseRequest {
    #[prost(message, optional, tag = "1")]
    pub client_id: ::core::option::Option<ClientIdentification>,
    #[prost(message, optional, tag = "2")]
    pub content_id: ::core::option::Option<license_request::ContentIdentification>,
    #[prost(enumeration = "license_request::RequestType", optional, tag = "3")]
    pub r#type: ::core::option::Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub request_time: ::core::option::Option<i64>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub key_control_nonce_deprecated: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "ProtocolVersion", optional, tag = "6")]
    pub protocol_version: ::core::option::Option<i32>,
    #[prost(uint32, optional, tag = "7")]
    pub key_control_nonce: ::core::option::Option<u32>,
    #[prost(message, optional, tag = "8")]
    pub encrypted_client_id: ::core::option::Option<EncryptedClientIdentification>,
}

/// Nested message and enum types in `LicenseRequest`.
pub mod license_request {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ContentIdentification {
        #[prost(oneof = "content_identification::ContentIdVariant", tags = "1")]
        pub content_id_variant: ::core::option::Option<content_identification::ContentIdVariant>,
    }

    /// Nested message and enum types in `ContentIdentification`.
    pub mod content_identification {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct WidevinePsshData {
            #[prost(bytes = "vec", repeated, tag = "1")]
            pub pssh_data: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
            #[prost(enumeration = "super::super::LicenseType", optional, tag = "2")]
            pub license_type: ::core::option::Option<i32>,
            #[prost(bytes = "vec", optional, tag = "3")]
            pub request_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        }

        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum ContentIdVariant {
            #[prost(message, tag = "1")]
            WidevinePsshData(WidevinePsshData),
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RequestType {
        New = 1,
        Renewal = 2,
        Release = 3,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedMessage {
    #[prost(enumeration = "signed_message::MessageType", optional, tag = "1")]
    pub r#type: ::core::option::Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub msg: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub signature: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub session_key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "signed_message::SessionKeyType", optional, tag = "8")]
    pub session_key_type: ::core::option::Option<i32>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub oemcrypto_core_message: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Nested message and enum types in `SignedMessage`.
pub mod signed_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MessageType {
        LicenseRequest = 1,
        License = 2,
        ErrorResponse = 3,
        ServiceCertificateRequest = 4,
        ServiceCertificate = 5,
        SubLicense = 6,
        CasLicenseRequest = 7,
        CasLicense = 8,
        ExternalLicenseRequest = 9,
        ExternalLicense = 10,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum SessionKeyType {
        Undefined = 0,
        WrappedAesKey = 1,
        EphermeralEccPublicKey = 2,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientIdentification {
    #[prost(enumeration = "client_identification::TokenType", optional, tag = "1")]
    pub r#type: ::core::option::Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub token: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, repeated, tag = "3")]
    pub client_info: ::prost::alloc::vec::Vec<client_identification::NameValue>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub provider_client_token: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub license_counter: ::core::option::Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub client_capabilities: ::core::option::Option<client_identification::ClientCapabilities>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub vmp_data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Nested message and enum types in `ClientIdentification`.
pub mod client_identification {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NameValue {
        #[prost(string, optional, tag = "1")]
        pub name: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(string, optional, tag = "2")]
        pub value: ::core::option::Option<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ClientCapabilities {
        #[prost(bool, optional, tag = "1")]
        pub client_token: ::core::option::Option<bool>,
        #[prost(bool, optional, tag = "2")]
        pub session_token: ::core::option::Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub video_resolution_constraints: ::core::option::Option<bool>,
        #[prost(int32, optional, tag = "4")]
        pub max_hdcp_version: ::core::option::Option<i32>,
        #[prost(uint32, optional, tag = "5")]
        pub oem_crypto_api_version: ::core::option::Option<u32>,
        #[prost(bool, optional, tag = "6")]
        pub anti_rollback_usage_table: ::core::option::Option<bool>,
        #[prost(uint32, optional, tag = "7")]
        pub srm_version: ::core::option::Option<u32>,
        #[prost(bool, optional, tag = "8")]
        pub can_update_srm: ::core::option::Option<bool>,
        #[prost(int32, optional, tag = "10")]
        pub analog_output_capabilities: ::core::option::Option<i32>,
        #[prost(bool, optional, tag = "11")]
        pub can_disable_analog_output: ::core::option::Option<bool>,
        #[prost(uint32, optional, tag = "12")]
        pub resource_rating_tier: ::core::option::Option<u32>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum TokenType {
        Keybox = 0,
        DrmDeviceCertificate = 1,
        RemoteAttestationCertificate = 2,
        OemDeviceCertificate = 3,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedClientIdentification {
    #[prost(string, optional, tag = "1")]
    pub provider_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub service_certificate_serial_number: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub encrypted_client_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub encrypted_client_id_iv: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub encrypted_privacy_key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DrmCertificate {
    #[prost(enumeration = "drm_certificate::Type", optional, tag = "1")]
    pub r#type: ::core::option::Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub serial_number: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint32, optional, tag = "3")]
    pub creation_time_seconds: ::core::option::Option<u32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub public_key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub system_id: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "7")]
    pub provider_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "12")]
    pub expiration_time_seconds: ::core::option::Option<u32>,
}

/// Nested message and enum types in `DrmCertificate`.
pub mod drm_certificate {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Root = 0,
        DeviceModel = 1,
        Device = 2,
        Service = 3,
        Provisioner = 4,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedDrmCertificate {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub drm_certificate: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, optional, boxed, tag = "3")]
    pub signer: ::core::option::Option<::prost::alloc::boxed::Box<SignedDrmCertificate>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WidevinePsshData {
    #[prost(enumeration = "widevine_pssh_data::Algorithm", optional, tag = "1")]
    pub algorithm: ::core::option::Option<i32>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub key_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub provider: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub content_id: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub policy: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "7")]
    pub crypto_period_index: ::core::option::Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub protection_scheme: ::core::option::Option<u32>,
}

/// Nested message and enum types in `WidevinePsshData`.
pub mod widevine_pssh_data {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Algorithm {
        Unencrypted = 0,
        Aesctr = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileHashes {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub signer: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub signatures: ::prost::alloc::vec::Vec<file_hashes::Signature>,
}

/// Nested message and enum types in `FileHashes`.
pub mod file_hashes {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Signature {
        #[prost(string, optional, tag = "1")]
        pub filename: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(bool, optional, tag = "2")]
        pub test_signing: ::core::option::Option<bool>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub sha512_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        #[prost(bool, optional, tag = "4")]
        pub main_exe: ::core::option::Option<bool>,
        #[prost(bytes = "vec", optional, tag = "5")]
        pub signature: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }
}
